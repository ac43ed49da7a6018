//! Cluster scheduler trait seam and job-spec types.
//!
//! The cluster backend submits each job as a three-phase spec: an input
//! container stages data into a shared volume, the main container runs the
//! algorithm image, and an output container uploads the results. Status is
//! read by polling; logs are fetched per pod, per container.

use super::RuntimeError;
use std::future::Future;
use std::pin::Pin;

/// Boxed future type for dyn-compatible cluster methods.
pub type ClusterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RuntimeError>> + Send + 'a>>;

/// Resource requests/limits for one container.
#[derive(Debug, Clone, Default)]
pub struct ResourceRequirements {
    pub memory_bytes: u64,
    pub cpu_millis: u64,
    /// GPU type requested, e.g. `nvidia.com/gpu`. `None` requests no GPU.
    pub gpu_type: Option<String>,
    pub gpu_count: u64,
}

/// A scheduling toleration attached for GPU nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toleration {
    pub key: String,
    pub value: String,
}

/// One container in the job spec.
#[derive(Debug, Clone)]
pub struct ClusterContainer {
    pub name: String,
    pub image: String,
    /// Command override; `None` runs the image's default entrypoint.
    pub command: Option<Vec<String>>,
    pub env: Vec<(String, String)>,
    pub resources: ResourceRequirements,
    /// Mount targets for the shared per-job volume.
    pub volume_mounts: Vec<String>,
}

/// The dedicated per-job persistent volume claim.
#[derive(Debug, Clone)]
pub struct VolumeClaimSpec {
    pub name: String,
    pub storage_bytes: u64,
}

/// A submitted cluster job: three-phase container list sharing one volume.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub volume_claim: VolumeClaimSpec,
    /// Runs before the main container: stages inputs into the shared volume.
    pub input_container: ClusterContainer,
    /// The algorithm image.
    pub main_container: ClusterContainer,
    /// Runs after the main container: uploads the shared output volume.
    pub output_container: ClusterContainer,
    pub tolerations: Vec<Toleration>,
    /// Hard deadline the scheduler enforces on the whole job, in seconds.
    pub active_deadline_secs: u64,
}

/// Completion state reported by the cluster for a job resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterJobStatus {
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl ClusterJobStatus {
    /// Whether the job's completion condition reports success.
    pub fn is_succeeded(&self) -> bool {
        self.succeeded > 0
    }

    /// Whether the job's completion condition reports failure.
    pub fn is_failed(&self) -> bool {
        self.failed > 0
    }

    /// Whether the job has reached either completion condition.
    pub fn is_terminal(&self) -> bool {
        self.is_succeeded() || self.is_failed()
    }
}

/// A pod belonging to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
}

/// Cluster scheduler capability set used by the cluster backend.
pub trait ClusterApi: Send + Sync + 'static {
    /// Submits a job spec. Non-blocking: returns once the resource is
    /// accepted, not when the job completes.
    fn create_job<'a>(&'a self, spec: &'a JobSpec) -> ClusterFuture<'a, ()>;

    /// Reads the job's current completion state.
    fn read_job_status<'a>(&'a self, name: &'a str) -> ClusterFuture<'a, ClusterJobStatus>;

    /// Pods labeled with the given job id.
    fn list_pods<'a>(&'a self, job_id: &'a str) -> ClusterFuture<'a, Vec<PodRef>>;

    /// Logs for one container of one pod. `None` means the pod has produced
    /// no log yet; that is not an error.
    fn pod_logs<'a>(
        &'a self,
        pod: &'a PodRef,
        container: &'a str,
    ) -> ClusterFuture<'a, Option<String>>;

    /// Deletes the job resource.
    fn delete_job<'a>(&'a self, name: &'a str) -> ClusterFuture<'a, ()>;

    /// Deletes the job's pods.
    fn delete_pods<'a>(&'a self, job_id: &'a str) -> ClusterFuture<'a, ()>;

    /// Deletes the per-job volume claim.
    fn delete_volume_claim<'a>(&'a self, name: &'a str) -> ClusterFuture<'a, ()>;
}
