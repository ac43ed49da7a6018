//! Cluster job backend.
//!
//! Submits the job to a cluster scheduler as a three-phase spec sharing one
//! per-job volume claim: an input container stages data down from object
//! storage, the main container runs the algorithm image, and an output
//! container uploads the results back. Submission is non-blocking; progress
//! is observed by polling the job status, and deployments with a completion
//! callback can short-circuit the poll through [`Executor::handle_event`].

use super::{ExecFuture, ExecutionPhase, Executor, ExecutorEvent, LogBuffer, collect_outputs};
use crate::config::ComponentsSettings;
use crate::error::ComponentError;
use crate::interfaces::{ComponentInterface, ComponentInterfaceValue};
use crate::job::Job;
use crate::retry::RetryPolicy;
use crate::runtime::{
    ClusterApi, ClusterContainer, ClusterJobStatus, JobSpec, ResourceRequirements, RuntimeError,
    Toleration, VolumeClaimSpec,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Container names inside the job spec, in execution order.
const INPUT_CONTAINER: &str = "input";
const MAIN_CONTAINER: &str = "main";
const OUTPUT_CONTAINER: &str = "output";

/// Executes one job through a cluster scheduler.
pub struct ClusterJobExecutor {
    job_id: String,
    job_name: String,
    claim_name: String,
    image: String,
    command: Option<Vec<String>>,
    gpu_type: Option<String>,
    memory_limit_bytes: u64,
    active_deadline: Duration,
    settings: Arc<ComponentsSettings>,
    api: Arc<dyn ClusterApi>,
    staging: crate::storage::JobStaging,
    completion: Option<ClusterJobStatus>,
    completion_message: Option<String>,
    stdout: LogBuffer,
    stderr: LogBuffer,
    duration: Option<Duration>,
    phase: ExecutionPhase,
}

impl ClusterJobExecutor {
    pub fn new(
        job: &Job,
        settings: Arc<ComponentsSettings>,
        api: Arc<dyn ClusterApi>,
        staging: crate::storage::JobStaging,
    ) -> Self {
        let limit = settings.log_capture_limit_bytes;
        let job_id = job.id.to_string();
        Self {
            job_name: format!("job-{job_id}"),
            claim_name: format!("job-{job_id}-pvc"),
            job_id,
            image: job
                .image_digest
                .clone()
                .unwrap_or_else(|| job.image.clone()),
            command: job.command.clone(),
            gpu_type: job.gpu_type.clone(),
            memory_limit_bytes: job.memory_limit_bytes.unwrap_or(settings.memory_limit_bytes),
            active_deadline: settings.effective_time_limit(job.time_limit),
            settings,
            api,
            staging,
            completion: None,
            completion_message: None,
            stdout: LogBuffer::new(limit),
            stderr: LogBuffer::new(limit),
            duration: None,
            phase: ExecutionPhase::Created,
        }
    }

    fn build_spec(&self) -> JobSpec {
        let prefix = self.staging.prefix().as_str().to_string();
        let cpu_millis =
            (self.settings.cpu_quota_us * 1000) / self.settings.cpu_period_us.max(1);

        let input_container = ClusterContainer {
            name: INPUT_CONTAINER.to_string(),
            image: self.settings.io_image.clone(),
            command: Some(vec![
                "crucible-io".to_string(),
                "download".to_string(),
                "--bucket".to_string(),
                self.settings.input_bucket.clone(),
                "--prefix".to_string(),
                prefix.clone(),
                "--dest".to_string(),
                "/input".to_string(),
            ]),
            env: Vec::new(),
            resources: ResourceRequirements::default(),
            volume_mounts: vec!["/input".to_string()],
        };

        let main_container = ClusterContainer {
            name: MAIN_CONTAINER.to_string(),
            image: self.image.clone(),
            command: self.command.clone(),
            env: Vec::new(),
            resources: ResourceRequirements {
                memory_bytes: self.memory_limit_bytes,
                cpu_millis,
                gpu_type: self.gpu_type.clone(),
                gpu_count: u64::from(self.gpu_type.is_some()),
            },
            volume_mounts: vec!["/input".to_string(), "/output".to_string()],
        };

        let output_container = ClusterContainer {
            name: OUTPUT_CONTAINER.to_string(),
            image: self.settings.io_image.clone(),
            command: Some(vec![
                "crucible-io".to_string(),
                "upload".to_string(),
                "--bucket".to_string(),
                self.settings.output_bucket.clone(),
                "--prefix".to_string(),
                prefix,
                "--src".to_string(),
                "/output".to_string(),
                "--archive".to_string(),
            ]),
            env: Vec::new(),
            resources: ResourceRequirements::default(),
            volume_mounts: vec!["/output".to_string()],
        };

        JobSpec {
            name: self.job_name.clone(),
            labels: vec![(crate::runtime::JOB_LABEL_KEY.to_string(), self.job_id.clone())],
            volume_claim: VolumeClaimSpec {
                name: self.claim_name.clone(),
                storage_bytes: self.settings.cluster_volume_bytes,
            },
            input_container,
            main_container,
            output_container,
            tolerations: self
                .gpu_type
                .iter()
                .map(|gpu| Toleration {
                    key: gpu.clone(),
                    value: "present".to_string(),
                })
                .collect(),
            active_deadline_secs: self.active_deadline.as_secs(),
        }
    }

    /// Polls the job status until a completion condition is reported. The
    /// surrounding time limit bounds this loop.
    async fn poll_to_completion(&mut self) -> Result<ClusterJobStatus, ComponentError> {
        loop {
            if let Some(status) = self.completion {
                return Ok(status);
            }
            let status = self
                .api
                .read_job_status(&self.job_name)
                .await
                .map_err(runtime_err)?;
            debug!(job_id = %self.job_id, ?status, "Polled cluster job status");
            if status.is_terminal() {
                self.completion = Some(status);
                return Ok(status);
            }
            tokio::time::sleep(self.settings.cluster_poll_interval).await;
        }
    }

    /// Fetches per-pod, per-container logs. A pod without a log yet is
    /// "no log", not an error.
    async fn capture_logs(&mut self) {
        let pods = match self.api.list_pods(&self.job_id).await {
            Ok(pods) => pods,
            Err(err) => {
                warn!(job_id = %self.job_id, error = %err, "Could not list pods for logs");
                return;
            }
        };
        for pod in &pods {
            for container in [INPUT_CONTAINER, MAIN_CONTAINER, OUTPUT_CONTAINER] {
                let log = match self.api.pod_logs(pod, container).await {
                    Ok(log) => log,
                    Err(err) => {
                        warn!(
                            job_id = %self.job_id,
                            pod = %pod.name,
                            container,
                            error = %err,
                            "Could not fetch container log"
                        );
                        continue;
                    }
                };
                let Some(text) = log else { continue };
                for line in text.lines() {
                    if container == MAIN_CONTAINER {
                        self.stdout.push_line(line);
                    } else {
                        self.stderr.push_line(&format!("[{container}] {line}"));
                    }
                }
            }
        }
    }
}

impl Executor for ClusterJobExecutor {
    fn provision<'a>(&'a mut self, inputs: &'a [ComponentInterfaceValue]) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            self.phase.expect(ExecutionPhase::Created)?;
            self.staging
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
            let spec = self.build_spec();
            info!(job_id = %self.job_id, job_name = %self.job_name, "Submitting cluster job");
            self.api.create_job(&spec).await.map_err(runtime_err)?;

            let started = Instant::now();
            let status = self.poll_to_completion().await?;
            self.duration = Some(started.elapsed());
            self.capture_logs().await;

            if status.is_failed() {
                let message = self
                    .completion_message
                    .clone()
                    .unwrap_or_else(|| "the cluster job reported failure".to_string());
                return Err(ComponentError::Runtime(message));
            }
            self.phase = ExecutionPhase::Executed;
            Ok(())
        })
    }

    fn handle_event<'a>(&'a mut self, event: ExecutorEvent) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            let ExecutorEvent::JobCompleted { succeeded, message } = event;
            info!(
                job_id = %self.job_id,
                succeeded,
                "Received cluster completion event"
            );
            self.completion = Some(if succeeded {
                ClusterJobStatus {
                    succeeded: 1,
                    ..Default::default()
                }
            } else {
                ClusterJobStatus {
                    failed: 1,
                    ..Default::default()
                }
            });
            self.completion_message = message.clone();
            self.capture_logs().await;

            if succeeded {
                // Execution finished externally; the invocation may move
                // straight to output collection.
                self.phase = ExecutionPhase::Executed;
                Ok(())
            } else {
                Err(ComponentError::Runtime(message.unwrap_or_else(|| {
                    "the cluster job reported failure".to_string()
                })))
            }
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
            let mut first_error: Option<ComponentError> = None;
            let mut note = |label: &str, result: Result<(), RuntimeError>| {
                if let Err(err) = result {
                    warn!(job_id = %self.job_id, target = label, error = %err, "Cluster delete failed");
                    if first_error.is_none() {
                        first_error = Some(runtime_err(err));
                    }
                }
            };

            // The three deletions are independent: one failing must not
            // prevent the others.
            let policy = RetryPolicy::default();
            note(
                "pods",
                policy
                    .run(|| self.api.delete_pods(&self.job_id), RuntimeError::is_transient)
                    .await,
            );
            note(
                "job",
                policy
                    .run(|| self.api.delete_job(&self.job_name), RuntimeError::is_transient)
                    .await,
            );
            note(
                "volume_claim",
                policy
                    .run(
                        || self.api.delete_volume_claim(&self.claim_name),
                        RuntimeError::is_transient,
                    )
                    .await,
            );

            let storage_result = self
                .staging
                .deprovision()
                .await
                .map(|_| ())
                .map_err(|err| ComponentError::Runtime(err.to_string()));
            self.phase = ExecutionPhase::Deprovisioned;

            match (first_error, storage_result) {
                (Some(err), _) => Err(err),
                (None, result) => result,
            }
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
                "job_name": self.job_name,
            })
        })
    }

    fn is_event_driven(&self) -> bool {
        true
    }
}

fn runtime_err(err: RuntimeError) -> ComponentError {
    ComponentError::Runtime(err.to_string())
}
