//! Local container backend.
//!
//! Runs the job as a container via the container-runtime trait:
//!
//! 1. Create two ephemeral volumes (input, output), labeled with the job id.
//! 2. Ensure the I/O helper image and the algorithm image are present,
//!    loading the algorithm image from a local archive when its
//!    content-addressed digest is not already known to the runtime.
//! 3. Copy staged inputs into the input volume through an I/O helper
//!    container, file by file, as in-memory tar streams.
//! 4. Normalize permissions on both volumes: the algorithm image may run as
//!    an arbitrary UID.
//! 5. Run the algorithm container hardened: no network, all capabilities
//!    dropped, no-new-privileges, pids/memory/CPU limits from settings.
//! 6. Read results back out of the output volume as an archive stream (a
//!    stdout pipe could truncate) and upload them to the output bucket.
//!
//! Cleanup stops and force-removes everything labeled with the job id and
//! retries the host-wide prune with bounded backoff, since only one prune
//! may run at a time.

use super::{ExecFuture, ExecutionPhase, Executor, ExecutorEvent, LogBuffer, collect_outputs};
use crate::config::ComponentsSettings;
use crate::error::ComponentError;
use crate::interfaces::{ComponentInterface, ComponentInterfaceValue};
use crate::job::Job;
use crate::retry::RetryPolicy;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::storage::{JobStaging, StagedInput};
use bytes::Bytes;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How many trailing stderr lines feed the failure message.
const STDERR_TAIL_LINES: usize = 10;

/// Preallocation ceiling per archive entry. The declared header size is a
/// hint from untrusted container output, never an allocation request.
const UNTAR_PREALLOC_CAP: u64 = 1024 * 1024;

/// Executes one job through a local/remote container-runtime API.
pub struct LocalContainerExecutor {
    job_id: String,
    image: String,
    image_digest: Option<String>,
    image_archive: Option<Bytes>,
    memory_limit_bytes: u64,
    settings: Arc<ComponentsSettings>,
    runtime: Arc<dyn ContainerRuntime>,
    staging: JobStaging,
    staged: Vec<StagedInput>,
    stdout: LogBuffer,
    stderr: LogBuffer,
    duration: Option<Duration>,
    exit_code: Option<i64>,
    phase: ExecutionPhase,
}

impl LocalContainerExecutor {
    pub fn new(
        job: &Job,
        settings: Arc<ComponentsSettings>,
        runtime: Arc<dyn ContainerRuntime>,
        staging: JobStaging,
    ) -> Self {
        let limit = settings.log_capture_limit_bytes;
        Self {
            job_id: job.id.to_string(),
            image: job.image.clone(),
            image_digest: job.image_digest.clone(),
            image_archive: job.image_archive.clone(),
            memory_limit_bytes: job.memory_limit_bytes.unwrap_or(settings.memory_limit_bytes),
            settings,
            runtime,
            staging,
            staged: Vec::new(),
            stdout: LogBuffer::new(limit),
            stderr: LogBuffer::new(limit),
            duration: None,
            exit_code: None,
            phase: ExecutionPhase::Created,
        }
    }

    fn input_volume(&self) -> String {
        format!("{}-input", self.job_id)
    }

    fn output_volume(&self) -> String {
        format!("{}-output", self.job_id)
    }

    fn job_labels(&self) -> Vec<(String, String)> {
        vec![(crate::runtime::JOB_LABEL_KEY.to_string(), self.job_id.clone())]
    }

    fn helper_spec(&self) -> ContainerSpec {
        ContainerSpec::hardened(&self.settings.io_image).with_job_label(&self.job_id)
    }

    async fn create_volumes(&self) -> Result<(), ComponentError> {
        let labels = self.job_labels();
        for name in [self.input_volume(), self.output_volume()] {
            self.runtime
                .create_volume(&name, &labels)
                .await
                .map_err(runtime_err)?;
        }
        Ok(())
    }

    /// Pulls the helper image, then makes sure the algorithm image is
    /// present by content digest, loading the local archive when it is not.
    async fn ensure_images(&self) -> Result<(), ComponentError> {
        if !self
            .runtime
            .image_exists(&self.settings.io_image)
            .await
            .map_err(runtime_err)?
        {
            self.runtime
                .pull_image(&self.settings.io_image)
                .await
                .map_err(runtime_err)?;
        }

        let wanted = self.image_digest.as_deref().unwrap_or(&self.image);
        if self.runtime.image_exists(wanted).await.map_err(runtime_err)? {
            return Ok(());
        }
        if let Some(archive) = &self.image_archive {
            info!(job_id = %self.job_id, image = %wanted, "Loading algorithm image from archive");
            self.runtime
                .load_image_archive(archive.clone())
                .await
                .map_err(runtime_err)?;
        } else {
            self.runtime
                .pull_image(&self.image)
                .await
                .map_err(runtime_err)?;
        }
        Ok(())
    }

    /// Copies each staged input into the input volume through a created
    /// (never started) helper container, one in-memory tar stream per file.
    async fn copy_inputs(&self) -> Result<(), ComponentError> {
        let spec = self
            .helper_spec()
            .with_mount(self.input_volume(), "/input", false);
        let writer = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(runtime_err)?;

        let mut result = Ok(());
        for staged in &self.staged {
            let data = match self.staging.read_input(staged).await {
                Ok(data) => data,
                Err(err) => {
                    result = Err(ComponentError::Provisioning(err.to_string()));
                    break;
                }
            };
            let tar = match tar_blob(&staged.dest_path, &data) {
                Ok(tar) => tar,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };
            debug!(job_id = %self.job_id, path = %staged.dest_path, "Copying input into volume");
            if let Err(err) = self.runtime.put_archive(&writer, "/input", tar).await {
                result = Err(runtime_err(err));
                break;
            }
        }

        if let Err(err) = self.runtime.remove_container(&writer).await {
            warn!(job_id = %self.job_id, error = %err, "Could not remove input writer container");
        }
        result
    }

    /// Makes both volumes world-writable. The algorithm container may run
    /// as any UID.
    async fn normalize_permissions(&self) -> Result<(), ComponentError> {
        let spec = self
            .helper_spec()
            .with_cmd(
                ["chmod", "-R", "o+rwX", "/input", "/output"]
                    .map(String::from)
                    .to_vec(),
            )
            .with_mount(self.input_volume(), "/input", false)
            .with_mount(self.output_volume(), "/output", false);
        let exit = self
            .runtime
            .run_container(&spec)
            .await
            .map_err(runtime_err)?;
        if exit.exit_code != 0 {
            return Err(ComponentError::Runtime(format!(
                "could not normalize volume permissions, chmod exited with {}",
                exit.exit_code
            )));
        }
        Ok(())
    }

    async fn run_algorithm(&mut self) -> Result<(), ComponentError> {
        let image = self
            .image_digest
            .clone()
            .unwrap_or_else(|| self.image.clone());
        let mut spec = ContainerSpec::hardened(image)
            .with_job_label(&self.job_id)
            .with_mount(self.input_volume(), "/input", true)
            .with_mount(self.output_volume(), "/output", false);
        spec.pids_limit = self.settings.pids_limit;
        spec.memory_limit_bytes = self.memory_limit_bytes;
        spec.cpu_period_us = self.settings.cpu_period_us;
        spec.cpu_quota_us = self.settings.cpu_quota_us;
        spec.cpu_shares = self.settings.cpu_shares;

        info!(job_id = %self.job_id, image = %spec.image, "Running algorithm container");
        let started = Instant::now();
        let exit = self
            .runtime
            .run_container(&spec)
            .await
            .map_err(runtime_err)?;
        self.duration = Some(started.elapsed());
        self.exit_code = Some(exit.exit_code);
        self.stdout.extend(exit.stdout.iter().map(String::as_str));
        self.stderr.extend(exit.stderr.iter().map(String::as_str));

        if exit.exit_code != 0 {
            return Err(ComponentError::NonZeroExit {
                exit_code: exit.exit_code,
                stderr_tail: self.stderr.tail(STDERR_TAIL_LINES),
            });
        }
        Ok(())
    }

    /// Reads the output volume back as one archive stream and uploads every
    /// file to the output bucket under the job prefix.
    async fn upload_results(&self) -> Result<(), ComponentError> {
        let spec = self
            .helper_spec()
            .with_mount(self.output_volume(), "/output", true);
        let reader = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(runtime_err)?;
        let archive = self.runtime.get_archive(&reader, "/output").await;
        if let Err(err) = self.runtime.remove_container(&reader).await {
            warn!(job_id = %self.job_id, error = %err, "Could not remove output reader container");
        }

        let archive = archive.map_err(runtime_err)?;
        for (path, data) in untar_blob(&archive)? {
            let relative = normalize_output_path(&path);
            if relative.is_empty() {
                continue;
            }
            self.staging
                .put_output(&relative, data)
                .await
                .map_err(|err| ComponentError::Runtime(err.to_string()))?;
        }
        Ok(())
    }

    async fn cleanup_runtime(&self) -> Result<(), ComponentError> {
        let containers = self
            .runtime
            .list_containers(&self.job_id)
            .await
            .map_err(runtime_err)?;
        for id in &containers {
            if let Err(err) = self.runtime.stop_container(id).await {
                debug!(job_id = %self.job_id, container = %id, error = %err, "Stop failed");
            }
            if let Err(err) = self.runtime.remove_container(id).await {
                warn!(job_id = %self.job_id, container = %id, error = %err, "Force remove failed");
            }
        }

        let volumes = self
            .runtime
            .list_volumes(&self.job_id)
            .await
            .map_err(runtime_err)?;
        for name in &volumes {
            if let Err(err) = self.runtime.remove_volume(name).await {
                warn!(job_id = %self.job_id, volume = %name, error = %err, "Volume remove failed");
            }
        }

        // Only one prune may run host-wide at a time; contended calls fail
        // transiently and are retried with bounded backoff.
        RetryPolicy::default()
            .run(|| self.runtime.prune(), RuntimeError::is_transient)
            .await
            .map_err(runtime_err)
    }
}

impl Executor for LocalContainerExecutor {
    fn provision<'a>(&'a mut self, inputs: &'a [ComponentInterfaceValue]) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            self.phase.expect(ExecutionPhase::Created)?;
            self.staged = self
                .staging
                .stage_inputs(inputs)
                .await
                .map_err(|err| ComponentError::Provisioning(err.to_string()))?;
            self.phase = ExecutionPhase::Provisioned;
            Ok(())
        })
    }

    fn execute<'a>(&'a mut self) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            self.phase.expect(ExecutionPhase::Provisioned)?;
            self.create_volumes().await?;
            self.ensure_images().await?;
            self.copy_inputs().await?;
            self.normalize_permissions().await?;
            self.run_algorithm().await?;
            self.upload_results().await?;
            self.phase = ExecutionPhase::Executed;
            Ok(())
        })
    }

    fn handle_event<'a>(&'a mut self, event: ExecutorEvent) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            // Poll-based backend: completion is observed inside execute().
            debug!(job_id = %self.job_id, ?event, "Ignoring event on poll-based backend");
            Ok(())
        })
    }

    fn get_outputs<'a>(
        &'a mut self,
        interfaces: &'a [ComponentInterface],
    ) -> ExecFuture<'a, Vec<ComponentInterfaceValue>> {
        Box::pin(async move {
            self.phase.expect(ExecutionPhase::Executed)?;
            let outputs = collect_outputs(&self.staging, interfaces).await?;
            self.phase = ExecutionPhase::Collected;
            Ok(outputs)
        })
    }

    fn deprovision<'a>(&'a mut self) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            let storage_result = self
                .staging
                .deprovision()
                .await
                .map(|_| ())
                .map_err(|err| ComponentError::Runtime(err.to_string()));
            let runtime_result = self.cleanup_runtime().await;
            self.phase = ExecutionPhase::Deprovisioned;
            storage_result.and(runtime_result)
        })
    }

    fn stdout(&self) -> String {
        self.stdout.contents().to_string()
    }

    fn stderr(&self) -> String {
        self.stderr.contents().to_string()
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn runtime_metrics(&self) -> Option<serde_json::Value> {
        self.duration.map(|duration| {
            serde_json::json!({
                "duration_ms": duration.as_millis() as u64,
                "exit_code": self.exit_code,
            })
        })
    }

    fn is_event_driven(&self) -> bool {
        false
    }
}

fn runtime_err(err: RuntimeError) -> ComponentError {
    ComponentError::Runtime(err.to_string())
}

// =============================================================================
// Tar helpers
// =============================================================================

/// Packs one file into an in-memory tar stream.
fn tar_blob(path: &str, data: &[u8]) -> Result<Bytes, ComponentError> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, data)
        .map_err(|err| ComponentError::Runtime(format!("could not build input archive: {err}")))?;
    let inner = builder
        .into_inner()
        .map_err(|err| ComponentError::Runtime(format!("could not finish input archive: {err}")))?;
    Ok(Bytes::from(inner))
}

/// Unpacks every regular file from a tar stream.
fn untar_blob(data: &[u8]) -> Result<Vec<(String, Bytes)>, ComponentError> {
    let mut archive = tar::Archive::new(data);
    let mut files = Vec::new();
    let entries = archive
        .entries()
        .map_err(|err| ComponentError::Runtime(format!("could not parse output archive: {err}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| {
            ComponentError::Runtime(format!("could not parse output archive: {err}"))
        })?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|err| {
                ComponentError::Runtime(format!("could not parse output archive: {err}"))
            })?
            .to_string_lossy()
            .into_owned();
        let mut buf = Vec::with_capacity(entry.size().min(UNTAR_PREALLOC_CAP) as usize);
        entry.read_to_end(&mut buf).map_err(|err| {
            ComponentError::Runtime(format!("could not read output archive entry: {err}"))
        })?;
        files.push((path, Bytes::from(buf)));
    }
    Ok(files)
}

/// Strips the archive's leading `output/` directory component.
fn normalize_output_path(path: &str) -> String {
    let trimmed = path.trim_start_matches("./").trim_start_matches('/');
    trimmed
        .strip_prefix("output/")
        .unwrap_or(trimmed)
        .to_string()
}
