//! Trait seams over the external execution substrates.
//!
//! The container runtime and the cluster scheduler are shared, fallible
//! systems. This crate only ever mutates them through these traits, and
//! every resource they create is labeled `job_id=<id>` so cleanup can be
//! scoped to one job.

pub mod cluster;

pub use cluster::{
    ClusterApi, ClusterContainer, ClusterJobStatus, ClusterFuture, JobSpec, PodRef,
    ResourceRequirements, Toleration, VolumeClaimSpec,
};

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Label key scoping every container and volume to its job.
pub const JOB_LABEL_KEY: &str = "job_id";

/// Boxed future type for dyn-compatible runtime methods.
pub type RuntimeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RuntimeError>> + Send + 'a>>;

/// Errors from the container runtime API.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("image error: {0}")]
    Image(String),

    #[error("container error: {0}")]
    Container(String),

    #[error("volume error: {0}")]
    Volume(String),

    #[error("archive error: {0}")]
    Archive(String),

    /// Another prune is already running host-wide. Transient.
    #[error("a prune operation is already in progress")]
    PruneInProgress,
}

impl RuntimeError {
    /// Whether a bounded backoff retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::PruneInProgress)
    }
}

/// Opaque handle to a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub volume: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create one container.
///
/// The hardening block defaults to the locked-down configuration used for
/// algorithm containers; helper containers relax `network_disabled` only if
/// they genuinely need the network.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    /// Command override; `None` runs the image's default entrypoint.
    pub cmd: Option<Vec<String>>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub labels: Vec<(String, String)>,
    pub network_disabled: bool,
    pub cap_drop_all: bool,
    pub no_new_privileges: bool,
    pub pids_limit: u64,
    pub memory_limit_bytes: u64,
    pub cpu_period_us: u64,
    pub cpu_quota_us: u64,
    pub cpu_shares: u64,
}

impl ContainerSpec {
    /// A locked-down spec: no network, no capabilities, no privilege
    /// escalation.
    pub fn hardened(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            cmd: None,
            env: Vec::new(),
            mounts: Vec::new(),
            labels: Vec::new(),
            network_disabled: true,
            cap_drop_all: true,
            no_new_privileges: true,
            pids_limit: 64,
            memory_limit_bytes: 1024 * 1024 * 1024,
            cpu_period_us: 100_000,
            cpu_quota_us: 100_000,
            cpu_shares: 1024,
        }
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    pub fn with_mount(mut self, volume: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        self.mounts.push(Mount {
            volume: volume.into(),
            target: target.into(),
            read_only,
        });
        self
    }

    pub fn with_job_label(mut self, job_id: &str) -> Self {
        self.labels
            .push((JOB_LABEL_KEY.to_string(), job_id.to_string()));
        self
    }
}

/// Exit state of a container run to completion.
#[derive(Debug, Clone, Default)]
pub struct ContainerExit {
    pub exit_code: i64,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Container-runtime capability set used by the local backend.
///
/// Implementations wrap a local or remote container-runtime API. Methods
/// are dyn-compatible boxed futures so the backend can hold the runtime as
/// a trait object.
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Creates a named volume carrying the given labels.
    fn create_volume<'a>(
        &'a self,
        name: &'a str,
        labels: &'a [(String, String)],
    ) -> RuntimeFuture<'a, ()>;

    /// Whether an image is already present, by reference or content digest.
    fn image_exists<'a>(&'a self, reference: &'a str) -> RuntimeFuture<'a, bool>;

    /// Pulls an image by reference.
    fn pull_image<'a>(&'a self, reference: &'a str) -> RuntimeFuture<'a, ()>;

    /// Loads an image from an archive blob.
    fn load_image_archive<'a>(&'a self, archive: Bytes) -> RuntimeFuture<'a, ()>;

    /// Creates a container without starting it. Used by the I/O helper flow
    /// to move archives in and out of volumes.
    fn create_container<'a>(&'a self, spec: &'a ContainerSpec) -> RuntimeFuture<'a, ContainerId>;

    /// Runs a container to completion and returns its exit state with
    /// captured log lines.
    fn run_container<'a>(&'a self, spec: &'a ContainerSpec) -> RuntimeFuture<'a, ContainerExit>;

    /// Extracts a tar stream into a container at `path`.
    fn put_archive<'a>(
        &'a self,
        id: &'a ContainerId,
        path: &'a str,
        tar: Bytes,
    ) -> RuntimeFuture<'a, ()>;

    /// Reads `path` out of a container as a tar stream. Reading via an
    /// archive avoids the truncation a stdout pipe would risk.
    fn get_archive<'a>(&'a self, id: &'a ContainerId, path: &'a str) -> RuntimeFuture<'a, Bytes>;

    /// Stops a running container.
    fn stop_container<'a>(&'a self, id: &'a ContainerId) -> RuntimeFuture<'a, ()>;

    /// Force-removes a container.
    fn remove_container<'a>(&'a self, id: &'a ContainerId) -> RuntimeFuture<'a, ()>;

    /// Containers carrying the given label value.
    fn list_containers<'a>(&'a self, job_id: &'a str) -> RuntimeFuture<'a, Vec<ContainerId>>;

    /// Volumes carrying the given label value.
    fn list_volumes<'a>(&'a self, job_id: &'a str) -> RuntimeFuture<'a, Vec<String>>;

    /// Force-removes a volume.
    fn remove_volume<'a>(&'a self, name: &'a str) -> RuntimeFuture<'a, ()>;

    /// Prunes stopped containers and dangling volumes. Only one prune may
    /// run host-wide at a time; concurrent calls fail with
    /// [`RuntimeError::PruneInProgress`].
    fn prune<'a>(&'a self) -> RuntimeFuture<'a, ()>;
}
