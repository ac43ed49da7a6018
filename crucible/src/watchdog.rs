//! Timeout watchdog.
//!
//! Backstop for jobs whose execution path died without reaching the normal
//! completion handling (worker crash, lost cluster callback). Periodically
//! sweeps all `Started` jobs and fails any that have been running longer
//! than their time limit times a grace multiplier. The multiplier leaves
//! room for the in-band timeout to fire first, so a healthy worker always
//! reports the failure itself.
//!
//! The watchdog only flips status; it never touches backend resources and
//! never dispatches continuations. Deprovisioning for swept jobs happens
//! when their executor path resumes or during backend garbage collection,
//! and the store's claim flag keeps continuation dispatch at most once if
//! that path later completes.

use crate::config::ComponentsSettings;
use crate::error::ComponentError;
use crate::job::{JobStatus, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Default sweep interval (60 seconds).
pub const SWEEP_INTERVAL_SECS: u64 = 60;

/// Sweeps long-running jobs into `Failure`.
pub struct TimeoutWatchdog {
    store: Arc<JobStore>,
    /// Grace multiplier applied on top of each job's time limit.
    multiplier: f64,
    /// Sweep interval.
    interval: Duration,
}

impl TimeoutWatchdog {
    pub fn new(store: Arc<JobStore>, settings: &ComponentsSettings) -> Self {
        Self {
            store,
            multiplier: settings.timeout_multiplier,
            interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
        }
    }

    /// Runs the watchdog until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }
    }

    /// One sweep over all started jobs. Returns how many were failed.
    pub fn sweep(&self) -> usize {
        let now = chrono::Utc::now();
        let mut swept = 0;

        for job in self.store.started_jobs() {
            // Both fields are populated before a job reaches `Started`.
            let (Some(limit), Some(started_at)) = (job.time_limit, job.started_at) else {
                continue;
            };
            let grace_ms = (limit.as_millis() as f64 * self.multiplier) as i64;
            let deadline = started_at + chrono::Duration::milliseconds(grace_ms);
            if now <= deadline {
                continue;
            }

            warn!(
                job_id = %job.id,
                started_at = %started_at,
                time_limit_secs = limit.as_secs(),
                "Job exceeded its time limit without reporting, marking failed"
            );
            match self.store.update_status(
                &job.id,
                JobStatus::Failure,
                None,
                None,
                Some(ComponentError::TimeLimitExceeded.user_message()),
            ) {
                Ok(()) => swept += 1,
                Err(err) => {
                    // Lost the race with the job's own completion handler.
                    error!(job_id = %job.id, error = %err, "Could not fail timed-out job");
                }
            }
        }

        if swept > 0 {
            debug!(swept, "Timeout sweep complete");
        }
        swept
    }
}
