//! Orchestration glue: drives one job from `Pending` to a terminal state.
//!
//! Each dispatched unit of work calls [`JobRunner::execute_job`]. The
//! sequence is: per-entity lock → status guard → admission re-check →
//! `Pending → Started` → provision → execute (bounded by the time limit) →
//! collect outputs → deprovision → persist the terminal state and fire the
//! continuation at most once.
//!
//! Deprovisioning runs on every exit path, whether or not an earlier step
//! failed; that guarantee is the central correctness property of this
//! module. Lock and admission rejections are retryable at the dispatch
//! layer and never become job failures. Unexpected errors are re-raised
//! after the job is marked failed, so the dispatch layer's own failure
//! accounting still sees them.

use crate::admission::AdmissionController;
use crate::config::ComponentsSettings;
use crate::error::{ComponentError, DispatchError};
use crate::executor::{Executor, ExecutorEvent, ExecutorFactory};
use crate::interfaces::ComponentInterfaceValue;
use crate::job::{Continuation, Job, JobId, JobStatus, JobStore};
use crate::lock::{self, LockManager};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// What a dispatched execution attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The job ran and reached `Success`.
    Completed,
    /// The job ran and reached `Failure`.
    Failed,
    /// The job was not in `Pending` (or vanished); nothing was done. This
    /// absorbs at-least-once dispatch from the queue layer.
    Skipped,
}

/// Receives at-most-once completion continuations. The surrounding
/// application supplies the implementation (queueing a follow-up task,
/// sending a notification, and so on).
pub trait ContinuationSink: Send + Sync + 'static {
    fn dispatch(&self, job_id: &JobId, continuation: &Continuation);
}

/// A sink that drops continuations, for deployments without follow-ups.
pub struct NullContinuationSink;

impl ContinuationSink for NullContinuationSink {
    fn dispatch(&self, job_id: &JobId, continuation: &Continuation) {
        info!(job_id = %job_id, continuation = %continuation.0, "Dropping continuation (null sink)");
    }
}

/// Drives jobs through the execution state machine.
pub struct JobRunner {
    settings: Arc<ComponentsSettings>,
    store: Arc<JobStore>,
    locks: LockManager,
    admission: AdmissionController,
    factory: ExecutorFactory,
    continuations: Arc<dyn ContinuationSink>,
}

impl JobRunner {
    pub fn new(
        settings: Arc<ComponentsSettings>,
        store: Arc<JobStore>,
        locks: LockManager,
        factory: ExecutorFactory,
        continuations: Arc<dyn ContinuationSink>,
    ) -> Self {
        let admission = AdmissionController::new(Arc::clone(&settings), Arc::clone(&store));
        Self {
            settings,
            store,
            locks,
            admission,
            factory,
            continuations,
        }
    }

    /// Executes a pending job. Idempotent: safe to invoke any number of
    /// times, only the first call while the job is `Pending` has effect.
    ///
    /// Retryable conditions (lock contention, admission rejection) surface
    /// as [`DispatchError`] variants the dispatch layer retries later.
    pub async fn execute_job(&self, id: &JobId) -> Result<ExecutionOutcome, DispatchError> {
        let _guard = self
            .locks
            .try_lock(lock::row_key("components", "job", &id.to_string()))?;

        let Some(job) = self.store.get(id) else {
            warn!(job_id = %id, "Execution requested for unknown job");
            return Ok(ExecutionOutcome::Skipped);
        };
        if job.status != JobStatus::Pending {
            info!(job_id = %id, status = %job.status, "Job is not pending, skipping execution");
            return Ok(ExecutionOutcome::Skipped);
        }

        // Last-moment re-check: dispatch may have been delayed arbitrarily.
        self.admission.try_admit(&job)?;

        let time_limit = self
            .store
            .ensure_time_limit(id, self.settings.effective_time_limit(job.time_limit))
            .map_err(|err| DispatchError::Unexpected(err.to_string()))?;

        let started = self
            .store
            .mark_started(id)
            .map_err(|err| DispatchError::Unexpected(err.to_string()))?;
        if !started {
            info!(job_id = %id, "Job left pending between guard and start, skipping");
            return Ok(ExecutionOutcome::Skipped);
        }

        let job = self.store.get(id).ok_or_else(|| {
            DispatchError::Unexpected(format!("job {id} vanished after start"))
        })?;

        let mut executor = match self.factory.create(&job) {
            Ok(executor) => executor,
            Err(err) => return self.fail_without_executor(&job, err),
        };

        let run_result = self.run_sequence(executor.as_mut(), &job, time_limit).await;
        self.finish(&job, executor, run_result).await
    }

    /// Feeds an asynchronous backend completion callback into the same
    /// completion path the poll-based flow uses.
    pub async fn handle_event(
        &self,
        id: &JobId,
        event: ExecutorEvent,
    ) -> Result<ExecutionOutcome, DispatchError> {
        let _guard = self
            .locks
            .try_lock(lock::row_key("components", "job", &id.to_string()))?;

        let Some(job) = self.store.get(id) else {
            warn!(job_id = %id, "Event received for unknown job");
            return Ok(ExecutionOutcome::Skipped);
        };
        if job.status != JobStatus::Started {
            info!(job_id = %id, status = %job.status, "Event for non-started job, skipping");
            return Ok(ExecutionOutcome::Skipped);
        }

        let mut executor = match self.factory.create(&job) {
            Ok(executor) => executor,
            Err(err) => return self.fail_without_executor(&job, err),
        };

        let run_result = async {
            executor.handle_event(event).await?;
            executor.get_outputs(&job.output_interfaces).await
        }
        .await;
        self.finish(&job, executor, run_result).await
    }

    /// The strictly sequential provision → execute → collect pipeline.
    /// `execute` is bounded by the job's time limit.
    async fn run_sequence(
        &self,
        executor: &mut dyn Executor,
        job: &Job,
        time_limit: Duration,
    ) -> Result<Vec<ComponentInterfaceValue>, ComponentError> {
        executor.provision(&job.inputs).await?;

        match tokio::time::timeout(time_limit, executor.execute()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(ComponentError::TimeLimitExceeded),
        }

        executor.get_outputs(&job.output_interfaces).await
    }

    /// Persists the terminal state. Deprovisioning always runs first,
    /// regardless of how the run ended.
    async fn finish(
        &self,
        job: &Job,
        mut executor: Box<dyn Executor>,
        run_result: Result<Vec<ComponentInterfaceValue>, ComponentError>,
    ) -> Result<ExecutionOutcome, DispatchError> {
        if let Err(err) = executor.deprovision().await {
            // Cleanup failure never overrides the job's own result.
            warn!(job_id = %job.id, error = %err, "Deprovision failed");
        }

        let stdout = executor.stdout();
        let stderr = executor.stderr();

        match run_result {
            Ok(outputs) => {
                if let Err(err) = self.store.set_outputs(&job.id, outputs) {
                    return self.fail_terminal(job, stdout, stderr, ComponentError::Internal(err.to_string()));
                }
                if let Err(err) = self.store.update_status(
                    &job.id,
                    JobStatus::Success,
                    Some(stdout),
                    Some(stderr),
                    None,
                ) {
                    return Err(DispatchError::Unexpected(err.to_string()));
                }
                info!(job_id = %job.id, duration = ?executor.duration(), "Job succeeded");
                self.dispatch_continuation(job, JobStatus::Success);
                Ok(ExecutionOutcome::Completed)
            }
            Err(err) => self.fail_terminal(job, stdout, stderr, err),
        }
    }

    /// Marks the job failed. Unclassified errors are re-raised after the
    /// status flip so the dispatch layer's observability sees them.
    fn fail_terminal(
        &self,
        job: &Job,
        stdout: String,
        stderr: String,
        err: ComponentError,
    ) -> Result<ExecutionOutcome, DispatchError> {
        if let Err(store_err) = self.store.update_status(
            &job.id,
            JobStatus::Failure,
            Some(stdout),
            Some(stderr),
            Some(err.user_message()),
        ) {
            error!(job_id = %job.id, error = %store_err, "Could not persist job failure");
            return Err(DispatchError::Unexpected(store_err.to_string()));
        }
        self.dispatch_continuation(job, JobStatus::Failure);

        if err.is_unexpected() {
            error!(job_id = %job.id, error = %err, "Unexpected execution error");
            return Err(DispatchError::Unexpected(err.to_string()));
        }
        info!(job_id = %job.id, error = %err, "Job failed");
        Ok(ExecutionOutcome::Failed)
    }

    fn fail_without_executor(
        &self,
        job: &Job,
        err: ComponentError,
    ) -> Result<ExecutionOutcome, DispatchError> {
        self.fail_terminal(job, String::new(), String::new(), err)
    }

    /// Fires the continuation for a terminal status at most once, no matter
    /// how many times the completion handler runs.
    fn dispatch_continuation(&self, job: &Job, status: JobStatus) {
        let Some(continuation) = job.continuation_for(status) else {
            return;
        };
        match self.store.claim_continuation(&job.id) {
            Ok(true) => {
                info!(job_id = %job.id, continuation = %continuation.0, "Dispatching continuation");
                self.continuations.dispatch(&job.id, continuation);
            }
            Ok(false) => {
                info!(job_id = %job.id, "Continuation already dispatched, skipping");
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "Could not claim continuation");
            }
        }
    }
}
