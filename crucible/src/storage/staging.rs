//! The I/O staging protocol.
//!
//! Inputs are written under the job prefix before execution; outputs are
//! read back from the job prefix plus each output interface's declared
//! relative path. When several logical inputs share an interface slug, each
//! instance gets a numbered sub-prefix so their files cannot collide.

use super::{JobPrefix, ObjectStore, StorageError};
use crate::interfaces::ComponentInterfaceValue;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// One staged input: where it lives in storage and where the container
/// expects it under `/input`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInput {
    /// Key in the input bucket.
    pub key: String,
    /// Destination path relative to the container's input root.
    pub dest_path: String,
}

/// Storage-side staging for one job.
pub struct JobStaging {
    store: Arc<dyn ObjectStore>,
    input_bucket: String,
    output_bucket: String,
    prefix: JobPrefix,
}

impl JobStaging {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        input_bucket: impl Into<String>,
        output_bucket: impl Into<String>,
        prefix: JobPrefix,
    ) -> Self {
        Self {
            store,
            input_bucket: input_bucket.into(),
            output_bucket: output_bucket.into(),
            prefix,
        }
    }

    pub fn prefix(&self) -> &JobPrefix {
        &self.prefix
    }

    /// Stages every input value under the job prefix. Inputs whose slug is
    /// unique go directly under the prefix; repeated slugs get a numbered
    /// sub-prefix per instance.
    pub async fn stage_inputs(
        &self,
        inputs: &[ComponentInterfaceValue],
    ) -> Result<Vec<StagedInput>, StorageError> {
        let mut staged = Vec::with_capacity(inputs.len());
        for (index, civ) in inputs.iter().enumerate() {
            let shared_slug = inputs
                .iter()
                .filter(|other| other.interface.slug == civ.interface.slug)
                .count()
                > 1;
            let dest_path = if shared_slug {
                format!("{}/{}", index, civ.interface.relative_path)
            } else {
                civ.interface.relative_path.clone()
            };
            let key = self.prefix.key(&dest_path);
            let data = civ.value.to_bytes().map_err(|err| {
                StorageError::Backend(format!(
                    "could not serialize input {}: {err}",
                    civ.interface.slug
                ))
            })?;
            debug!(
                slug = %civ.interface.slug,
                key = %key,
                bytes = data.len(),
                "Staging input"
            );
            self.store.put(&self.input_bucket, &key, data).await?;
            staged.push(StagedInput { key, dest_path });
        }
        Ok(staged)
    }

    /// Reads one staged input back, for backends that copy inputs into a
    /// volume themselves.
    pub async fn read_input(&self, staged: &StagedInput) -> Result<Bytes, StorageError> {
        self.store.get(&self.input_bucket, &staged.key).await
    }

    /// Writes a produced file into the output bucket under the job prefix.
    /// `relative` is the path the container wrote under its output root.
    pub async fn put_output(&self, relative: &str, data: Bytes) -> Result<(), StorageError> {
        let key = self.prefix.key(relative);
        self.store.put(&self.output_bucket, &key, data).await
    }

    /// Reads the output file for a declared relative path.
    pub async fn read_output(&self, relative: &str) -> Result<Bytes, StorageError> {
        self.store
            .get(&self.output_bucket, &self.prefix.key(relative))
            .await
    }

    /// Lists produced files under an output directory, returned as paths
    /// relative to the job prefix.
    pub async fn list_output_dir(&self, relative_dir: &str) -> Result<Vec<String>, StorageError> {
        let dir_prefix = format!("{}/", self.prefix.key(relative_dir));
        let keys = self
            .store
            .list_prefix(&self.output_bucket, &dir_prefix)
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&format!("{}/", self.prefix.as_str()))
                    .map(str::to_string)
            })
            .collect())
    }

    /// Deletes everything staged for this job, in both buckets.
    ///
    /// Blast-radius limiter: each deletion re-checks that the bucket is one
    /// of the two configured buckets and that the prefix has the job-scoped
    /// shape. A failed check is a programming error and nothing is deleted.
    pub async fn deprovision(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for bucket in [self.input_bucket.clone(), self.output_bucket.clone()] {
            removed += self.safe_delete(&bucket).await?;
        }
        Ok(removed)
    }

    async fn safe_delete(&self, bucket: &str) -> Result<usize, StorageError> {
        let prefix = self.prefix.as_str();
        if (bucket != self.input_bucket && bucket != self.output_bucket)
            || !JobPrefix::is_job_scoped(prefix)
        {
            warn!(bucket = %bucket, prefix = %prefix, "Refusing unsafe delete");
            return Err(StorageError::UnsafeDelete {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            });
        }
        // Trailing slash so "io/aa/bb/x" can never match "io/aa/bb/xy".
        let scoped = format!("{prefix}/");
        self.store.delete_prefix(bucket, &scoped).await
    }
}
