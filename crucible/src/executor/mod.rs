//! The pluggable execution backend abstraction.
//!
//! An [`Executor`] drives one job through a fixed per-invocation sequence:
//!
//! ```text
//! Created → Provisioned → Executed → Collected → Deprovisioned
//! ```
//!
//! Deprovisioning is guaranteed on every exit path by the orchestrator,
//! whether or not an earlier step failed. Two backends exist: the local
//! container backend and the cluster job backend, selected by configuration
//! and held behind the trait.

mod cluster;
mod local;
mod logs;
mod outputs;

pub use cluster::ClusterJobExecutor;
pub use local::LocalContainerExecutor;
pub use logs::LogBuffer;
pub use outputs::{coerce_non_finite_json, collect_outputs};

use crate::config::ComponentsSettings;
use crate::error::ComponentError;
use crate::interfaces::{ComponentInterface, ComponentInterfaceValue};
use crate::job::Job;
use crate::runtime::{ClusterApi, ContainerRuntime};
use crate::storage::{JobPrefix, JobStaging, ObjectStore};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed future type for dyn-compatible executor methods.
pub type ExecFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ComponentError>> + Send + 'a>>;

// =============================================================================
// Invocation state machine
// =============================================================================

/// Where an executor invocation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionPhase {
    Created,
    Provisioned,
    Executed,
    Collected,
    Deprovisioned,
}

impl ExecutionPhase {
    /// Checks that the invocation is in `expected` before a step runs.
    /// A mismatch is a bug in the orchestration, not a property of the job.
    pub fn expect(self, expected: ExecutionPhase) -> Result<(), ComponentError> {
        if self == expected {
            Ok(())
        } else {
            Err(ComponentError::Internal(format!(
                "executor step out of order: in phase {self:?}, expected {expected:?}"
            )))
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Push-channel events for event-driven backends. Poll-based backends
/// ignore these.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    /// The backend reports the workload finished.
    JobCompleted {
        succeeded: bool,
        message: Option<String>,
    },
}

// =============================================================================
// Executor trait
// =============================================================================

/// Capability set every execution backend provides.
///
/// `execute` blocks its caller for the full runtime of the workload; the
/// orchestrator wraps it in the job's time limit. Backends normalize every
/// infrastructure error into [`ComponentError`] before it escapes.
pub trait Executor: Send {
    /// Stages each input value into the job's namespaced storage location.
    fn provision<'a>(&'a mut self, inputs: &'a [ComponentInterfaceValue]) -> ExecFuture<'a, ()>;

    /// Runs the containerized workload to completion or failure.
    fn execute<'a>(&'a mut self) -> ExecFuture<'a, ()>;

    /// Feeds an asynchronous completion callback into the backend. No-op
    /// for poll-based backends.
    fn handle_event<'a>(&'a mut self, event: ExecutorEvent) -> ExecFuture<'a, ()>;

    /// Downloads and validates the artifact for each declared output
    /// interface.
    fn get_outputs<'a>(
        &'a mut self,
        interfaces: &'a [ComponentInterface],
    ) -> ExecFuture<'a, Vec<ComponentInterfaceValue>>;

    /// Tears down staged storage and every backend resource labeled with
    /// the job id. Must be safe to call after any earlier step failed.
    fn deprovision<'a>(&'a mut self) -> ExecFuture<'a, ()>;

    /// Captured stdout, bounded.
    fn stdout(&self) -> String;

    /// Captured stderr, bounded.
    fn stderr(&self) -> String;

    /// Backend-reported wall-clock duration of the workload, best-effort.
    fn duration(&self) -> Option<Duration>;

    /// Backend-reported runtime metrics blob, best-effort.
    fn runtime_metrics(&self) -> Option<serde_json::Value>;

    /// Whether the caller should expect `handle_event` completion callbacks
    /// in addition to the poll path.
    fn is_event_driven(&self) -> bool;
}

// =============================================================================
// Backend selection
// =============================================================================

/// Handles to whichever execution substrate this deployment talks to.
#[derive(Clone)]
pub enum BackendHandles {
    Local(Arc<dyn ContainerRuntime>),
    Cluster(Arc<dyn ClusterApi>),
}

/// Builds one executor per job against the configured backend.
pub struct ExecutorFactory {
    settings: Arc<ComponentsSettings>,
    object_store: Arc<dyn ObjectStore>,
    handles: BackendHandles,
}

impl ExecutorFactory {
    pub fn new(
        settings: Arc<ComponentsSettings>,
        object_store: Arc<dyn ObjectStore>,
        handles: BackendHandles,
    ) -> Self {
        Self {
            settings,
            object_store,
            handles,
        }
    }

    /// Creates a fresh executor invocation for the job.
    pub fn create(&self, job: &Job) -> Result<Box<dyn Executor>, ComponentError> {
        let prefix = JobPrefix::new(&job.id.to_string())
            .map_err(|err| ComponentError::Internal(err.to_string()))?;
        let staging = JobStaging::new(
            Arc::clone(&self.object_store),
            self.settings.input_bucket.clone(),
            self.settings.output_bucket.clone(),
            prefix,
        );
        Ok(match &self.handles {
            BackendHandles::Local(runtime) => Box::new(LocalContainerExecutor::new(
                job,
                Arc::clone(&self.settings),
                Arc::clone(runtime),
                staging,
            )),
            BackendHandles::Cluster(api) => Box::new(ClusterJobExecutor::new(
                job,
                Arc::clone(&self.settings),
                Arc::clone(api),
                staging,
            )),
        })
    }
}
