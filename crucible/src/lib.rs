//! Crucible: containerized job execution.
//!
//! Crucible runs user-submitted container images against staged input data,
//! collects their outputs, and drives each job through a small, strict state
//! machine under global and per-creator concurrency ceilings.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        JobRunner                             │
//! │  Lock → status guard → admission → provision → execute →    │
//! │  collect → deprovision (always) → terminal state            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌──────────────┐  ┌───────────────────┐   │
//! │  │ LockManager │  │ Admission    │  │ TimeoutWatchdog   │   │
//! │  │ (fail-fast) │  │ Controller   │  │ (periodic sweep)  │   │
//! │  └─────────────┘  └──────────────┘  └───────────────────┘   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    Executor (trait)                          │
//! │  ┌─────────────────────────┐  ┌─────────────────────────┐   │
//! │  │ LocalContainerExecutor  │  │ ClusterJobExecutor      │   │
//! │  │ volumes + hardened run  │  │ three-phase job spec    │   │
//! │  └─────────────────────────┘  └─────────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ContainerRuntime / ClusterApi / ObjectStore (trait seams)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! - **Job**: one execution attempt of a container image against a fixed,
//!   ordered set of interface values. Jobs move through
//!   `Validating → Pending → Started → Success | Failure`, with `Cancelled`
//!   reachable only by explicit external action.
//!
//! - **Executor**: the backend abstraction that provisions staged inputs,
//!   runs the workload, collects declared outputs, and tears everything
//!   down. Deprovisioning runs on every exit path.
//!
//! - **Staging**: every input and output lives under a per-job
//!   object-storage prefix (`io/<aa>/<bb>/<id>/...`). Deletion is guarded
//!   so it can only ever touch a job-scoped prefix in the two configured
//!   buckets.
//!
//! - **Admission**: fresh count queries against the job store gate the
//!   `Pending → Started` transition. Rejections are retryable at the
//!   dispatch layer, never job failures.

pub mod admission;
pub mod config;
pub mod error;
pub mod executor;
pub mod interfaces;
pub mod job;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod retry;
pub mod runtime;
pub mod storage;
pub mod watchdog;

pub use admission::AdmissionController;
pub use config::{BackendKind, ComponentsSettings};
pub use error::{AdmissionError, ComponentError, DispatchError, LockError};
pub use executor::{Executor, ExecutorEvent, ExecutorFactory};
pub use interfaces::{ComponentInterface, ComponentInterfaceValue, InterfaceKind, InterfaceValue};
pub use job::{Continuation, Job, JobId, JobStatus, JobStore};
pub use lock::LockManager;
pub use orchestrator::{ContinuationSink, ExecutionOutcome, JobRunner};
pub use retry::RetryPolicy;
pub use storage::{JobPrefix, ObjectStore};
pub use watchdog::TimeoutWatchdog;
