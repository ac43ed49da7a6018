//! Error taxonomy for the execution subsystem.
//!
//! Three families, matching how callers must react:
//!
//! - [`AdmissionError`] / [`LockError`] — retryable at the dispatch layer,
//!   never surfaced to the job as a failure.
//! - [`ComponentError`] — terminal: mapped to job `Failure` with a short,
//!   user-facing message. Backend-specific errors (container runtime,
//!   cluster API, storage) are normalized into this type before they reach
//!   the job state machine.
//! - [`ComponentError::Internal`] — the unclassified case. The state
//!   machine still marks the job `Failure`, then re-raises it as
//!   [`DispatchError::Unexpected`] so the dispatch layer's own failure
//!   accounting sees it.

use thiserror::Error;

/// Terminal execution errors, carrying the user-facing failure message.
#[derive(Debug, Clone, Error)]
pub enum ComponentError {
    /// A declared output interface produced no file.
    #[error("Output interface {slug} was not produced")]
    NotProduced { slug: String },

    /// An image-kind output directory contained no files.
    #[error("The output folder for {slug} is empty")]
    EmptyDirectory { slug: String },

    /// An image-kind output directory contained more than one image.
    #[error("Only 1 image output is allowed per interface, {slug} produced {count}")]
    TooManyImages { slug: String, count: usize },

    /// An image-kind output file was not a readable image.
    #[error("The output file for {slug} is not a valid image")]
    InvalidImage { slug: String },

    /// A JSON-kind output file did not parse as JSON.
    #[error("The output file for {slug} is not valid JSON: {reason}")]
    InvalidJson { slug: String, reason: String },

    /// An input value could not be staged.
    #[error("Could not provision job inputs: {0}")]
    Provisioning(String),

    /// The algorithm container exited with a non-zero code.
    #[error("The algorithm failed with exit code {exit_code}: {stderr_tail}")]
    NonZeroExit { exit_code: i64, stderr_tail: String },

    /// The job ran past its time limit.
    #[error("time limit exceeded")]
    TimeLimitExceeded,

    /// Normalized container-runtime / cluster / storage infrastructure error.
    #[error("The execution backend failed: {0}")]
    Runtime(String),

    /// A bug in this subsystem, not a property of the job. Re-raised to the
    /// dispatch layer after the job is marked failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ComponentError {
    /// Whether this error is an unclassified internal fault rather than a
    /// deterministic property of the job.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, ComponentError::Internal(_))
    }

    /// The short message persisted as the job's `error_message`.
    pub fn user_message(&self) -> String {
        match self {
            // Internal faults get a fixed message; details stay in the logs.
            ComponentError::Internal(_) => "An unexpected error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

/// Admission rejections. Retryable: the dispatch layer tries again later.
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    /// The global or per-creator active-job ceiling would be exceeded.
    #[error("too many jobs scheduled: {active} active against a ceiling of {ceiling}")]
    TooManyJobsScheduled { active: usize, ceiling: usize },
}

/// Lock acquisition failures. Retryable: acquisition is fail-fast, never a
/// wait queue.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// Another holder already has the lock for this entity.
    #[error("lock not acquired for {key}")]
    NotAcquired { key: String },
}

/// Union error consumed by the dispatch wrapper around each orchestration
/// step.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// Unclassified error re-raised after the job was marked failed.
    #[error("unexpected execution error: {0}")]
    Unexpected(String),
}

impl DispatchError {
    /// Whether the dispatch layer should retry this unit of work later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Admission(_) | DispatchError::Lock(_)
        )
    }
}
