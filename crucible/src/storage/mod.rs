//! Object-storage trait seam and the per-job key namespace.
//!
//! Real deployments point [`ObjectStore`] at S3-compatible storage; the
//! in-tree [`InMemoryObjectStore`] backs tests and single-host setups. All
//! staged data lives under a [`JobPrefix`] derived from the job id, and
//! deletion is guarded so it can only ever touch a job-scoped prefix inside
//! the two configured buckets.

mod memory;
mod staging;

pub use memory::InMemoryObjectStore;
pub use staging::{JobStaging, StagedInput};

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future type for dyn-compatible store methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Errors from the object store.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// No object at the given key.
    #[error("no object at {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Refused to delete outside a job-scoped prefix in a known bucket.
    #[error("refusing to delete {bucket}/{prefix}: not a job-scoped prefix in a known bucket")]
    UnsafeDelete { bucket: String, prefix: String },

    /// The job id cannot be used to build a storage prefix.
    #[error("invalid job id for storage prefix: {id:?}")]
    InvalidPrefix { id: String },

    /// Error reported by the storage backend.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Minimal object-store capability set used by the staging protocol.
pub trait ObjectStore: Send + Sync + 'static {
    /// Writes an object, replacing any existing one.
    fn put<'a>(&'a self, bucket: &'a str, key: &'a str, data: Bytes) -> StorageFuture<'a, ()>;

    /// Reads an object.
    fn get<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, Bytes>;

    /// Lists keys under a prefix, in lexicographic order.
    fn list_prefix<'a>(&'a self, bucket: &'a str, prefix: &'a str)
    -> StorageFuture<'a, Vec<String>>;

    /// Deletes every object under a prefix, returning the number removed.
    /// Callers must go through [`JobStaging::deprovision`], which enforces
    /// the job-scoped-prefix guard.
    fn delete_prefix<'a>(&'a self, bucket: &'a str, prefix: &'a str) -> StorageFuture<'a, usize>;
}

// =============================================================================
// Job prefix
// =============================================================================

/// The validated per-job storage namespace: `io/<aa>/<bb>/<id>`.
///
/// The first two path components fan keys out across the keyspace; the third
/// is the full job id. Construction fails unless the id is plain ASCII
/// alphanumeric, so no traversal characters can ever reach a storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPrefix(String);

impl JobPrefix {
    /// Builds the prefix for a job id. The id must be at least four ASCII
    /// alphanumeric characters; anything else is rejected outright.
    pub fn new(job_id: &str) -> Result<Self, StorageError> {
        if job_id.len() < 4 || !job_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StorageError::InvalidPrefix {
                id: job_id.to_string(),
            });
        }
        Ok(Self(format!(
            "io/{}/{}/{}",
            &job_id[0..2],
            &job_id[2..4],
            job_id
        )))
    }

    /// The prefix itself, without a trailing slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A full key under this prefix. `relative` must already be validated
    /// (see [`crate::interfaces::is_safe_relative_path`]).
    pub fn key(&self, relative: &str) -> String {
        format!("{}/{}", self.0, relative)
    }

    /// Whether a prefix string has the job-scoped shape this module
    /// produces. Used as the deletion guard's second check.
    pub fn is_job_scoped(prefix: &str) -> bool {
        let segments: Vec<&str> = prefix.split('/').collect();
        segments.len() == 4
            && segments[0] == "io"
            && segments[1].len() == 2
            && segments[2].len() == 2
            && segments[3].len() >= 4
            && segments[3].chars().all(|c| c.is_ascii_alphanumeric())
            && segments[3].starts_with(segments[1])
            && &segments[3][2..4] == segments[2]
    }
}
