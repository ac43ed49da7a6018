//! Output collection and validation.
//!
//! After execution, every declared output interface is read back from the
//! job's storage prefix and validated by kind. Validation failures are
//! terminal job failures with a user-facing message, never crashes.

use crate::error::ComponentError;
use crate::interfaces::{
    ComponentInterface, ComponentInterfaceValue, InterfaceKind, InterfaceValue,
};
use crate::storage::{JobStaging, StorageError};
use tracing::debug;

/// Collects and validates all declared outputs.
pub async fn collect_outputs(
    staging: &JobStaging,
    interfaces: &[ComponentInterface],
) -> Result<Vec<ComponentInterfaceValue>, ComponentError> {
    let mut outputs = Vec::with_capacity(interfaces.len());
    for interface in interfaces {
        let value = match interface.kind {
            InterfaceKind::Image => collect_image(staging, interface).await?,
            InterfaceKind::Json => collect_json(staging, interface).await?,
            InterfaceKind::File => collect_file(staging, interface).await?,
        };
        debug!(slug = %interface.slug, "Collected output");
        outputs.push(ComponentInterfaceValue::new(interface.clone(), value));
    }
    Ok(outputs)
}

/// Exactly one image must exist under the interface's output directory.
async fn collect_image(
    staging: &JobStaging,
    interface: &ComponentInterface,
) -> Result<InterfaceValue, ComponentError> {
    let files = staging
        .list_output_dir(&interface.relative_path)
        .await
        .map_err(|err| runtime_err(&interface.slug, err))?;

    match files.len() {
        0 => Err(ComponentError::EmptyDirectory {
            slug: interface.slug.clone(),
        }),
        1 => {
            let data = staging
                .read_output(&files[0])
                .await
                .map_err(|err| runtime_err(&interface.slug, err))?;
            if image::guess_format(&data).is_err() {
                return Err(ComponentError::InvalidImage {
                    slug: interface.slug.clone(),
                });
            }
            Ok(InterfaceValue::Image(data))
        }
        count => Err(ComponentError::TooManyImages {
            slug: interface.slug.clone(),
            count,
        }),
    }
}

/// The output file must parse as JSON; non-finite numeric literals are
/// coerced to `null` rather than rejected.
async fn collect_json(
    staging: &JobStaging,
    interface: &ComponentInterface,
) -> Result<InterfaceValue, ComponentError> {
    let data = read_required(staging, interface).await?;
    let text = String::from_utf8_lossy(&data);
    let coerced = coerce_non_finite_json(&text);
    let value: serde_json::Value =
        serde_json::from_str(&coerced).map_err(|err| ComponentError::InvalidJson {
            slug: interface.slug.clone(),
            reason: err.to_string(),
        })?;
    Ok(InterfaceValue::Json(value))
}

/// Any other declared output is returned as an opaque blob.
async fn collect_file(
    staging: &JobStaging,
    interface: &ComponentInterface,
) -> Result<InterfaceValue, ComponentError> {
    let data = read_required(staging, interface).await?;
    Ok(InterfaceValue::File(data))
}

async fn read_required(
    staging: &JobStaging,
    interface: &ComponentInterface,
) -> Result<bytes::Bytes, ComponentError> {
    staging
        .read_output(&interface.relative_path)
        .await
        .map_err(|err| match err {
            StorageError::NotFound { .. } => ComponentError::NotProduced {
                slug: interface.slug.clone(),
            },
            other => runtime_err(&interface.slug, other),
        })
}

fn runtime_err(slug: &str, err: StorageError) -> ComponentError {
    ComponentError::Runtime(format!("could not read output {slug}: {err}"))
}

// =============================================================================
// Non-finite JSON coercion
// =============================================================================

/// Rewrites the bare tokens `NaN`, `Infinity`, and `-Infinity` to `null`
/// anywhere outside string literals, so output files written by permissive
/// JSON emitters still parse.
pub fn coerce_non_finite_json(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if b == b'\\' && i + 1 < bytes.len() {
                out.push(b);
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            if b == b'"' {
                in_string = false;
            }
            out.push(b);
            i += 1;
            continue;
        }

        match b {
            b'"' => {
                in_string = true;
                out.push(b);
                i += 1;
            }
            b'N' if token_at(bytes, i, b"NaN") && boundary_ok(bytes, &out, i, 3) => {
                out.extend_from_slice(b"null");
                i += 3;
            }
            b'I' if token_at(bytes, i, b"Infinity") && boundary_ok(bytes, &out, i, 8) => {
                out.extend_from_slice(b"null");
                i += 8;
            }
            b'-' if token_at(bytes, i + 1, b"Infinity") && boundary_ok(bytes, &out, i, 9) => {
                out.extend_from_slice(b"null");
                i += 9;
            }
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }

    // Only ASCII substitutions were made, so the bytes stay valid UTF-8.
    String::from_utf8_lossy(&out).into_owned()
}

fn token_at(bytes: &[u8], at: usize, token: &[u8]) -> bool {
    bytes.len() >= at + token.len() && &bytes[at..at + token.len()] == token
}

/// The token must not be glued to an identifier or number on either side.
fn boundary_ok(bytes: &[u8], out: &[u8], start: usize, len: usize) -> bool {
    let before_ok = out
        .last()
        .is_none_or(|b| !b.is_ascii_alphanumeric() && *b != b'_' && *b != b'.');
    let after_ok = bytes
        .get(start + len)
        .is_none_or(|b| !b.is_ascii_alphanumeric() && *b != b'_' && *b != b'.');
    before_ok && after_ok
}
