//! The job store: the sole mutation path for job state.
//!
//! Terminal transitions go through [`JobStore::update_status`], which
//! enforces the transition table and keeps the outputs invariant (outputs
//! non-empty only on `Success`). Admission counts are fresh queries over the
//! live map, never cached counters.

use super::{Job, JobId, JobStatus};
use crate::interfaces::ComponentInterfaceValue;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Store-level errors. These indicate misuse by this subsystem, not a
/// property of the job.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("no job with id {id}")]
    NotFound { id: JobId },

    #[error("illegal transition {from} -> {to} for job {id}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("outputs can only be set on a started job, {id} is {status}")]
    OutputsOnInactiveJob { id: JobId, status: JobStatus },
}

/// In-memory job store shared across workers.
#[derive(Default)]
pub struct JobStore {
    jobs: DashMap<JobId, Job>,
}

impl JobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a job. Replaces nothing: inserting an existing id is a
    /// no-op returning `false`.
    pub fn insert(&self, job: Job) -> bool {
        match self.jobs.entry(job.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(job);
                true
            }
        }
    }

    /// Snapshot of one job.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Applies a guarded status transition, persisting captured output and
    /// the failure reason atomically with the status flip.
    pub fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        stdout: Option<String>,
        stderr: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or(StoreError::NotFound { id: *id })?;
        let job = entry.value_mut();

        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id: *id,
                from: job.status,
                to: status,
            });
        }

        let from = job.status;
        job.status = status;
        match status {
            JobStatus::Started => job.started_at = Some(Utc::now()),
            _ if status.is_terminal() => job.stopped_at = Some(Utc::now()),
            _ => {}
        }
        if let Some(stdout) = stdout {
            job.stdout = stdout;
        }
        if let Some(stderr) = stderr {
            job.stderr = stderr;
        }
        job.error_message = error_message;
        if status != JobStatus::Success {
            // Outputs are only ever non-empty on success.
            job.outputs.clear();
        }

        info!(job_id = %id, from = %from, to = %status, "Job status updated");
        Ok(())
    }

    /// Compare-and-set `Pending → Started`. Returns `false` when the job is
    /// in any other state, which callers treat as "someone else got here
    /// first".
    pub fn mark_started(&self, id: &JobId) -> Result<bool, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or(StoreError::NotFound { id: *id })?;
        let job = entry.value_mut();
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        job.status = JobStatus::Started;
        job.started_at = Some(Utc::now());
        info!(job_id = %id, "Job started");
        Ok(true)
    }

    /// Moves a validated job into `Pending`.
    pub fn mark_pending(&self, id: &JobId) -> Result<(), StoreError> {
        self.update_status(id, JobStatus::Pending, None, None, None)
    }

    /// Cancels a job that has not started. Used when a sibling input fails
    /// validation.
    pub fn cancel(&self, id: &JobId, reason: impl Into<String>) -> Result<(), StoreError> {
        self.update_status(id, JobStatus::Cancelled, None, None, Some(reason.into()))
    }

    /// Ensures the time limit is populated before the job leaves `Pending`.
    pub fn ensure_time_limit(&self, id: &JobId, default: Duration) -> Result<Duration, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or(StoreError::NotFound { id: *id })?;
        let job = entry.value_mut();
        let limit = job.time_limit.unwrap_or(default);
        job.time_limit = Some(limit);
        Ok(limit)
    }

    /// Persists collected outputs. Only legal while the job is `Started`,
    /// immediately before the `Success` transition.
    pub fn set_outputs(
        &self,
        id: &JobId,
        outputs: Vec<ComponentInterfaceValue>,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or(StoreError::NotFound { id: *id })?;
        let job = entry.value_mut();
        if job.status != JobStatus::Started {
            return Err(StoreError::OutputsOnInactiveJob {
                id: *id,
                status: job.status,
            });
        }
        job.outputs = outputs;
        Ok(())
    }

    /// Claims the right to dispatch this job's continuation. The first call
    /// returns `true`; every later call returns `false`, regardless of how
    /// many times the completion handler runs.
    pub fn claim_continuation(&self, id: &JobId) -> Result<bool, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or(StoreError::NotFound { id: *id })?;
        let job = entry.value_mut();
        if job.continuation_dispatched {
            return Ok(false);
        }
        job.continuation_dispatched = true;
        Ok(true)
    }

    /// Count of non-terminal jobs, excluding the given id (the candidate
    /// being admitted does not count against itself).
    pub fn active_count_excluding(&self, excluded: &JobId) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.key() != excluded && entry.value().status.is_active())
            .count()
    }

    /// Count of non-terminal jobs for one creator, excluding the given id.
    pub fn active_count_for_creator_excluding(&self, creator: &str, excluded: &JobId) -> usize {
        self.jobs
            .iter()
            .filter(|entry| {
                entry.key() != excluded
                    && entry.value().creator == creator
                    && entry.value().status.is_active()
            })
            .count()
    }

    /// Snapshot of all jobs currently `Started`, for the timeout watchdog.
    pub fn started_jobs(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|entry| entry.value().status == JobStatus::Started)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    fn pending_job(creator: &str) -> Job {
        let mut job = Job::new(creator, "algo:latest");
        job.status = JobStatus::Pending;
        job
    }

    #[test]
    fn test_insert_is_idempotent() {
        let store = JobStore::new();
        let job = pending_job("alice");
        assert!(store.insert(job.clone()));
        assert!(!store.insert(job));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_mark_started_cas() {
        let store = JobStore::new();
        let job = pending_job("alice");
        let id = job.id;
        store.insert(job);

        assert!(store.mark_started(&id).unwrap());
        assert!(!store.mark_started(&id).unwrap());
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Started);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let store = JobStore::new();
        let job = pending_job("alice");
        let id = job.id;
        store.insert(job);

        let err = store
            .update_status(&id, JobStatus::Success, None, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_failure_clears_outputs_and_sets_message() {
        let store = JobStore::new();
        let job = pending_job("alice");
        let id = job.id;
        store.insert(job);
        store.mark_started(&id).unwrap();
        store
            .update_status(
                &id,
                JobStatus::Failure,
                Some("out".to_string()),
                Some("err".to_string()),
                Some("time limit exceeded".to_string()),
            )
            .unwrap();

        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failure);
        assert!(job.outputs.is_empty());
        assert_eq!(job.error_message.as_deref(), Some("time limit exceeded"));
        assert_eq!(job.stdout, "out");
        assert!(job.stopped_at.is_some());
    }

    #[test]
    fn test_continuation_claimed_once() {
        let store = JobStore::new();
        let job = pending_job("alice");
        let id = job.id;
        store.insert(job);

        assert!(store.claim_continuation(&id).unwrap());
        assert!(!store.claim_continuation(&id).unwrap());
        assert!(!store.claim_continuation(&id).unwrap());
    }

    #[test]
    fn test_active_counts_exclude_candidate_and_terminal_jobs() {
        let store = JobStore::new();
        let candidate = pending_job("alice");
        let candidate_id = candidate.id;
        store.insert(candidate);

        let other = pending_job("alice");
        let other_id = other.id;
        store.insert(other);

        let mut done = pending_job("bob");
        done.status = JobStatus::Success;
        store.insert(done);

        assert_eq!(store.active_count_excluding(&candidate_id), 1);
        assert_eq!(
            store.active_count_for_creator_excluding("alice", &candidate_id),
            1
        );
        assert_eq!(store.active_count_excluding(&other_id), 1);
        assert_eq!(store.active_count_for_creator_excluding("bob", &candidate_id), 0);
    }

    #[test]
    fn test_ensure_time_limit_defaults_once() {
        let store = JobStore::new();
        let job = pending_job("alice");
        let id = job.id;
        store.insert(job);

        let limit = store
            .ensure_time_limit(&id, Duration::from_secs(300))
            .unwrap();
        assert_eq!(limit, Duration::from_secs(300));
        // A second call keeps the populated value.
        let limit = store
            .ensure_time_limit(&id, Duration::from_secs(999))
            .unwrap();
        assert_eq!(limit, Duration::from_secs(300));
    }
}
