//! Component interfaces and their values.
//!
//! A component interface declares one named input or output of an algorithm:
//! a slug, a kind (image, JSON, or opaque file), and the relative path the
//! container reads it from or writes it to. A
//! [`ComponentInterfaceValue`] binds an interface to a concrete value.

use bytes::Bytes;
use serde_json::Value as JsonValue;

/// The kind of artifact an interface carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Exactly one image file under the interface's directory.
    Image,
    /// A file that must parse as JSON.
    Json,
    /// Any other file, treated as an opaque blob.
    File,
}

/// A declared input or output of an algorithm image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInterface {
    /// Stable identifier, e.g. `generic-medical-image`.
    pub slug: String,
    /// Artifact kind.
    pub kind: InterfaceKind,
    /// Path relative to the container's input or output root. For
    /// image-kind outputs this is the directory the image is written into.
    pub relative_path: String,
}

impl ComponentInterface {
    /// Creates an interface, rejecting relative paths that could escape the
    /// job's staging prefix. This is a hard precondition: no storage key is
    /// ever built from an unvalidated path.
    pub fn new(
        slug: impl Into<String>,
        kind: InterfaceKind,
        relative_path: impl Into<String>,
    ) -> Result<Self, InterfaceError> {
        let slug = slug.into();
        let relative_path = relative_path.into();

        if slug.is_empty() || !slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(InterfaceError::InvalidSlug { slug });
        }
        if !is_safe_relative_path(&relative_path) {
            return Err(InterfaceError::UnsafePath {
                path: relative_path,
            });
        }

        Ok(Self {
            slug,
            kind,
            relative_path,
        })
    }
}

/// Returns whether a relative path is safe to embed in a storage key:
/// non-empty, relative, and free of traversal or empty segments.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    path.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Interface construction errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InterfaceError {
    #[error("invalid interface slug: {slug:?}")]
    InvalidSlug { slug: String },

    #[error("unsafe interface path: {path:?}")]
    UnsafePath { path: String },
}

/// A concrete value bound to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceValue {
    /// An opaque file blob.
    File(Bytes),
    /// An image blob.
    Image(Bytes),
    /// An inline JSON value, serialized on staging.
    Json(JsonValue),
}

impl InterfaceValue {
    /// The bytes this value stages as.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        match self {
            InterfaceValue::File(data) | InterfaceValue::Image(data) => Ok(data.clone()),
            InterfaceValue::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
        }
    }
}

/// A named input or output value: interface plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentInterfaceValue {
    pub interface: ComponentInterface,
    pub value: InterfaceValue,
}

impl ComponentInterfaceValue {
    pub fn new(interface: ComponentInterface, value: InterfaceValue) -> Self {
        Self { interface, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_traversal_paths() {
        for path in ["../escape", "a/../b", "/absolute", "a//b", "", "dir/", "."] {
            assert!(
                ComponentInterface::new("slug", InterfaceKind::File, path).is_err(),
                "path {path:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_accepts_nested_relative_paths() {
        let interface =
            ComponentInterface::new("heatmap", InterfaceKind::Image, "images/heatmap").unwrap();
        assert_eq!(interface.relative_path, "images/heatmap");
    }

    #[test]
    fn test_rejects_bad_slugs() {
        assert!(ComponentInterface::new("", InterfaceKind::File, "a.json").is_err());
        assert!(ComponentInterface::new("a/b", InterfaceKind::File, "a.json").is_err());
    }

    #[test]
    fn test_json_value_serializes_on_staging() {
        let value = InterfaceValue::Json(serde_json::json!({"score": 0.9}));
        let bytes = value.to_bytes().unwrap();
        assert_eq!(&bytes[..], br#"{"score":0.9}"#);
    }
}
