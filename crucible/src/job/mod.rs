//! The job: one execution attempt of a container image.
//!
//! A job owns its status, timestamps, resource requirements, input values,
//! and collected outputs. Its id namespaces every external resource the
//! execution touches: storage prefixes, volumes, container and pod names.

mod store;

pub use store::{JobStore, StoreError};

use crate::interfaces::{ComponentInterface, ComponentInterfaceValue};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Job id
// =============================================================================

/// Unique job identifier.
///
/// Rendered without hyphens so the same string is valid as a storage key
/// segment, a volume name, and a label value.
#[derive(Clone, Copy, Hash, Eq, PartialEq)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0.simple())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Job lifecycle states.
///
/// Transitions are monotonic: `Validating → Pending → Started → Success |
/// Failure`, with `Cancelled` reachable only from `Validating` or `Pending`
/// by explicit external action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Inputs are still being resolved.
    Validating,
    /// Inputs complete; waiting to be dispatched.
    Pending,
    /// Accepted by an execution backend.
    Started,
    /// Terminal: outputs collected.
    Success,
    /// Terminal: execution failed.
    Failure,
    /// Terminal: superseded or externally cancelled before starting.
    Cancelled,
}

impl JobStatus {
    /// Whether this state can never be left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Cancelled
        )
    }

    /// Whether a job in this state counts against the admission ceilings.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self → to` is a legal transition.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Validating, Pending)
                | (Validating, Cancelled)
                | (Validating, Failure)
                | (Pending, Started)
                | (Pending, Cancelled)
                | (Pending, Failure)
                | (Started, Success)
                | (Started, Failure)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Validating => "validating",
            JobStatus::Pending => "pending",
            JobStatus::Started => "started",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

// =============================================================================
// Continuations
// =============================================================================

/// Opaque reference to a follow-up action owned by the surrounding
/// application, dispatched at most once on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation(pub String);

// =============================================================================
// Job
// =============================================================================

/// One execution attempt of a containerized workload.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Identity of the submitting user, for the per-creator ceiling.
    pub creator: String,
    pub status: JobStatus,
    pub created: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,

    /// Populated before the job leaves `Pending`; defaulted from settings
    /// when the owning algorithm does not set one.
    pub time_limit: Option<Duration>,
    pub memory_limit_bytes: Option<u64>,
    /// GPU type requested, `None` for CPU-only jobs.
    pub gpu_type: Option<String>,

    /// Algorithm image reference.
    pub image: String,
    /// Content digest of the image, used as the content-addressed id.
    pub image_digest: Option<String>,
    /// Local image archive to load when the digest is not present.
    pub image_archive: Option<Bytes>,
    /// Command override for the main container; `None` uses the image's
    /// default entrypoint.
    pub command: Option<Vec<String>>,

    /// Ordered input values.
    pub inputs: Vec<ComponentInterfaceValue>,
    /// Declared outputs the backend must collect.
    pub output_interfaces: Vec<ComponentInterface>,
    /// Produced values; non-empty only when status is `Success`.
    pub outputs: Vec<ComponentInterfaceValue>,

    /// Captured stdout, size-bounded by the executor.
    pub stdout: String,
    /// Captured stderr, size-bounded by the executor.
    pub stderr: String,
    /// Human-readable terminal failure reason.
    pub error_message: Option<String>,

    pub on_success: Option<Continuation>,
    pub on_failure: Option<Continuation>,
    /// Set by the store's claim when a continuation fires, guaranteeing
    /// at-most-once dispatch.
    pub continuation_dispatched: bool,
}

impl Job {
    /// Creates a job in `Validating` with no inputs yet.
    pub fn new(creator: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: JobId::random(),
            creator: creator.into(),
            status: JobStatus::Validating,
            created: Utc::now(),
            started_at: None,
            stopped_at: None,
            time_limit: None,
            memory_limit_bytes: None,
            gpu_type: None,
            image: image.into(),
            image_digest: None,
            image_archive: None,
            command: None,
            inputs: Vec::new(),
            output_interfaces: Vec::new(),
            outputs: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            error_message: None,
            on_success: None,
            on_failure: None,
            continuation_dispatched: false,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<ComponentInterfaceValue>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_output_interfaces(mut self, interfaces: Vec<ComponentInterface>) -> Self {
        self.output_interfaces = interfaces;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_gpu(mut self, gpu_type: impl Into<String>) -> Self {
        self.gpu_type = Some(gpu_type.into());
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_on_success(mut self, continuation: Continuation) -> Self {
        self.on_success = Some(continuation);
        self
    }

    pub fn with_on_failure(mut self, continuation: Continuation) -> Self {
        self.on_failure = Some(continuation);
        self
    }

    /// The continuation to fire for a terminal status, if any.
    pub fn continuation_for(&self, status: JobStatus) -> Option<&Continuation> {
        match status {
            JobStatus::Success => self.on_success.as_ref(),
            JobStatus::Failure => self.on_failure.as_ref(),
            _ => None,
        }
    }
}
