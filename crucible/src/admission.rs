//! Admission control.
//!
//! Gates the `Pending → Started` transition behind a global and a
//! per-creator ceiling on non-terminal jobs. Counts are fresh queries
//! against the store on every call; the small time-of-check/time-of-use
//! window this leaves is tolerated because a rejection only delays the job
//! (the dispatch layer retries later) and the per-entity lock prevents
//! double execution.

use crate::config::ComponentsSettings;
use crate::error::AdmissionError;
use crate::job::{Job, JobStore};
use std::sync::Arc;
use tracing::debug;

/// Decides whether a job may leave `Pending`. Stateless beyond its
/// configuration; never mutates the job.
pub struct AdmissionController {
    settings: Arc<ComponentsSettings>,
    store: Arc<JobStore>,
}

impl AdmissionController {
    pub fn new(settings: Arc<ComponentsSettings>, store: Arc<JobStore>) -> Self {
        Self { settings, store }
    }

    /// Accepts or rejects the job. Rejection is retryable at the dispatch
    /// layer and is never surfaced as a job failure.
    pub fn try_admit(&self, job: &Job) -> Result<(), AdmissionError> {
        let active = self.store.active_count_excluding(&job.id);
        if active >= self.settings.max_active_jobs {
            debug!(
                job_id = %job.id,
                active,
                ceiling = self.settings.max_active_jobs,
                "Rejecting job: global ceiling reached"
            );
            return Err(AdmissionError::TooManyJobsScheduled {
                active,
                ceiling: self.settings.max_active_jobs,
            });
        }

        let creator_active = self
            .store
            .active_count_for_creator_excluding(&job.creator, &job.id);
        if creator_active >= self.settings.max_active_jobs_per_creator {
            debug!(
                job_id = %job.id,
                creator = %job.creator,
                active = creator_active,
                ceiling = self.settings.max_active_jobs_per_creator,
                "Rejecting job: per-creator ceiling reached"
            );
            return Err(AdmissionError::TooManyJobsScheduled {
                active: creator_active,
                ceiling: self.settings.max_active_jobs_per_creator,
            });
        }

        Ok(())
    }
}
