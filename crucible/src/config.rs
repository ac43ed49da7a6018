//! Settings for the execution subsystem.
//!
//! All knobs live in [`ComponentsSettings`], an immutable struct injected
//! into the admission controller and each executor backend at construction.
//! Nothing in this crate reads ambient global state.

use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

/// Default per-job time limit when the owning algorithm does not set one.
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 60 * 60;

/// Upper bound on any per-job time limit.
pub const MAX_TIME_LIMIT_SECS: u64 = 24 * 60 * 60;

/// Default per-job memory limit (4 GiB).
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Default ceiling on jobs in a non-terminal state across the system.
pub const DEFAULT_MAX_ACTIVE_JOBS: usize = 128;

/// Default ceiling on non-terminal jobs per creator.
pub const DEFAULT_MAX_ACTIVE_JOBS_PER_CREATOR: usize = 16;

/// Watchdog grace multiplier: a started job is failed once it has been
/// running longer than `time_limit * multiplier`.
pub const DEFAULT_TIMEOUT_MULTIPLIER: f64 = 1.2;

/// Default cap on captured stdout/stderr, per stream.
pub const DEFAULT_LOG_CAPTURE_LIMIT_BYTES: usize = 256 * 1024;

/// Default CFS period for container CPU quotas (microseconds).
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

/// Default pids limit inside the algorithm container.
pub const DEFAULT_PIDS_LIMIT: u64 = 128;

/// Default relative CPU weight for the algorithm container.
pub const DEFAULT_CPU_SHARES: u64 = 1024;

// =============================================================================
// Backend selection
// =============================================================================

/// Which executor backend runs jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Run the job as a container via a local/remote container-runtime API.
    LocalContainer,
    /// Submit the job as a three-phase pod spec to a cluster scheduler.
    ClusterJob,
}

// =============================================================================
// Settings
// =============================================================================

/// Configuration for the containerized job execution subsystem.
#[derive(Debug, Clone)]
pub struct ComponentsSettings {
    /// Bucket holding staged job inputs.
    pub input_bucket: String,

    /// Bucket holding collected job outputs.
    pub output_bucket: String,

    /// Image used for I/O helper containers (copy-in, permissions, readback).
    pub io_image: String,

    /// Backend used to execute jobs.
    pub backend: BackendKind,

    /// Time limit applied to jobs whose algorithm does not set one.
    pub default_time_limit: Duration,

    /// Hard upper bound for any job time limit.
    pub max_time_limit: Duration,

    /// Memory limit for the algorithm container.
    pub memory_limit_bytes: u64,

    /// CFS period for the CPU quota, in microseconds.
    pub cpu_period_us: u64,

    /// CFS quota per period, in microseconds. `cpu_quota_us / cpu_period_us`
    /// is the number of CPUs the algorithm container may use.
    pub cpu_quota_us: u64,

    /// Relative CPU weight under contention.
    pub cpu_shares: u64,

    /// Pids limit inside the algorithm container.
    pub pids_limit: u64,

    /// Global ceiling on jobs in a non-terminal state.
    pub max_active_jobs: usize,

    /// Per-creator ceiling on jobs in a non-terminal state.
    pub max_active_jobs_per_creator: usize,

    /// Grace multiplier applied by the timeout watchdog.
    pub timeout_multiplier: f64,

    /// Cap on captured stdout/stderr, per stream.
    pub log_capture_limit_bytes: usize,

    /// Interval between cluster job status polls.
    pub cluster_poll_interval: Duration,

    /// Storage requested for the per-job volume claim on the cluster backend.
    pub cluster_volume_bytes: u64,
}

impl Default for ComponentsSettings {
    fn default() -> Self {
        Self {
            input_bucket: "crucible-inputs".to_string(),
            output_bucket: "crucible-outputs".to_string(),
            io_image: "crucible-io:latest".to_string(),
            backend: BackendKind::LocalContainer,
            default_time_limit: Duration::from_secs(DEFAULT_TIME_LIMIT_SECS),
            max_time_limit: Duration::from_secs(MAX_TIME_LIMIT_SECS),
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            cpu_period_us: DEFAULT_CPU_PERIOD_US,
            cpu_quota_us: 2 * DEFAULT_CPU_PERIOD_US,
            cpu_shares: DEFAULT_CPU_SHARES,
            pids_limit: DEFAULT_PIDS_LIMIT,
            max_active_jobs: DEFAULT_MAX_ACTIVE_JOBS,
            max_active_jobs_per_creator: DEFAULT_MAX_ACTIVE_JOBS_PER_CREATOR,
            timeout_multiplier: DEFAULT_TIMEOUT_MULTIPLIER,
            log_capture_limit_bytes: DEFAULT_LOG_CAPTURE_LIMIT_BYTES,
            cluster_poll_interval: Duration::from_secs(5),
            cluster_volume_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

impl ComponentsSettings {
    /// Clamps a requested time limit into `[1s, max_time_limit]`, falling
    /// back to the default when unset.
    pub fn effective_time_limit(&self, requested: Option<Duration>) -> Duration {
        let limit = requested.unwrap_or(self.default_time_limit);
        limit.clamp(Duration::from_secs(1), self.max_time_limit)
    }
}
