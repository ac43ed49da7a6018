//! End-to-end execution tests against fake backends.
//!
//! The fakes implement the runtime trait seams in memory: a container
//! runtime whose "algorithm" writes whatever files the test configures, a
//! cluster API fed a scripted status sequence, and a recording continuation
//! sink. Every scenario drives the real `JobRunner` pipeline.

use bytes::Bytes;
use crucible::executor::{BackendHandles, ExecutorEvent, ExecutorFactory};
use crucible::job::{Continuation, Job, JobId, JobStatus, JobStore};
use crucible::runtime::{
    ClusterApi, ClusterFuture, ClusterJobStatus, ContainerExit, ContainerId, ContainerRuntime,
    ContainerSpec, JobSpec, PodRef, RuntimeError, RuntimeFuture,
};
use crucible::storage::InMemoryObjectStore;
use crucible::{
    ComponentsSettings, ContinuationSink, DispatchError, ExecutionOutcome, InterfaceKind,
    InterfaceValue, JobRunner, LockManager, ObjectStore,
};
use crucible::{ComponentInterface, ComponentInterfaceValue};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Minimal PNG signature; enough for image format sniffing.
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

// =============================================================================
// Fake container runtime
// =============================================================================

/// In-memory container runtime. The "algorithm container" produces the
/// configured exit state, and the output volume contains the configured
/// files, returned through `get_archive` as a tar stream.
#[derive(Default)]
struct FakeContainerRuntime {
    /// Files the algorithm "wrote" under /output, as (path, bytes).
    output_files: Mutex<Vec<(String, Bytes)>>,
    /// Exit state of the algorithm container.
    exit: Mutex<ContainerExit>,
    /// Spec of the last algorithm container run.
    last_algorithm_spec: Mutex<Option<ContainerSpec>>,
    /// Tar payloads copied into the input volume.
    input_archives: Mutex<Vec<Bytes>>,

    live_containers: Mutex<Vec<ContainerId>>,
    live_volumes: Mutex<Vec<String>>,
    removed_volumes: Mutex<Vec<String>>,
    container_seq: AtomicUsize,

    prune_calls: AtomicUsize,
    /// Remaining prune calls that fail with `PruneInProgress`.
    prune_contention: AtomicUsize,
}

impl FakeContainerRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn write_output(&self, path: &str, data: &[u8]) {
        self.output_files
            .lock()
            .unwrap()
            .push((path.to_string(), Bytes::copy_from_slice(data)));
    }

    fn set_exit(&self, exit_code: i64, stdout: &[&str], stderr: &[&str]) {
        *self.exit.lock().unwrap() = ContainerExit {
            exit_code,
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
        };
    }

    fn contend_prunes(&self, failures: usize) {
        self.prune_contention.store(failures, Ordering::SeqCst);
    }

    fn output_tar(&self) -> Bytes {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in self.output_files.lock().unwrap().iter() {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("output/{path}"), &data[..])
                .unwrap();
        }
        Bytes::from(builder.into_inner().unwrap())
    }
}

impl ContainerRuntime for FakeContainerRuntime {
    fn create_volume<'a>(
        &'a self,
        name: &'a str,
        _labels: &'a [(String, String)],
    ) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.live_volumes.lock().unwrap().push(name.to_string());
            Ok(())
        })
    }

    fn image_exists<'a>(&'a self, _reference: &'a str) -> RuntimeFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }

    fn pull_image<'a>(&'a self, _reference: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn load_image_archive<'a>(&'a self, _archive: Bytes) -> RuntimeFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn create_container<'a>(&'a self, _spec: &'a ContainerSpec) -> RuntimeFuture<'a, ContainerId> {
        Box::pin(async move {
            let id = ContainerId(format!("c{}", self.container_seq.fetch_add(1, Ordering::SeqCst)));
            self.live_containers.lock().unwrap().push(id.clone());
            Ok(id)
        })
    }

    fn run_container<'a>(&'a self, spec: &'a ContainerSpec) -> RuntimeFuture<'a, ContainerExit> {
        Box::pin(async move {
            let is_helper = spec
                .cmd
                .as_ref()
                .is_some_and(|cmd| cmd.first().is_some_and(|c| c == "chmod"));
            if is_helper {
                return Ok(ContainerExit::default());
            }
            *self.last_algorithm_spec.lock().unwrap() = Some(spec.clone());
            Ok(self.exit.lock().unwrap().clone())
        })
    }

    fn put_archive<'a>(
        &'a self,
        _id: &'a ContainerId,
        _path: &'a str,
        tar: Bytes,
    ) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.input_archives.lock().unwrap().push(tar);
            Ok(())
        })
    }

    fn get_archive<'a>(&'a self, _id: &'a ContainerId, _path: &'a str) -> RuntimeFuture<'a, Bytes> {
        Box::pin(async move { Ok(self.output_tar()) })
    }

    fn stop_container<'a>(&'a self, _id: &'a ContainerId) -> RuntimeFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn remove_container<'a>(&'a self, id: &'a ContainerId) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.live_containers.lock().unwrap().retain(|c| c != id);
            Ok(())
        })
    }

    fn list_containers<'a>(&'a self, _job_id: &'a str) -> RuntimeFuture<'a, Vec<ContainerId>> {
        Box::pin(async move { Ok(self.live_containers.lock().unwrap().clone()) })
    }

    fn list_volumes<'a>(&'a self, _job_id: &'a str) -> RuntimeFuture<'a, Vec<String>> {
        Box::pin(async move { Ok(self.live_volumes.lock().unwrap().clone()) })
    }

    fn remove_volume<'a>(&'a self, name: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.live_volumes.lock().unwrap().retain(|v| v != name);
            self.removed_volumes.lock().unwrap().push(name.to_string());
            Ok(())
        })
    }

    fn prune<'a>(&'a self) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.prune_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.prune_contention.load(Ordering::SeqCst);
            if remaining > 0 {
                self.prune_contention.store(remaining - 1, Ordering::SeqCst);
                return Err(RuntimeError::PruneInProgress);
            }
            Ok(())
        })
    }
}

// =============================================================================
// Fake cluster API
// =============================================================================

/// Scripted cluster scheduler: `read_job_status` pops from a status queue
/// and holds the last entry once it runs dry.
#[derive(Default)]
struct FakeClusterApi {
    statuses: Mutex<VecDeque<ClusterJobStatus>>,
    submitted: Mutex<Vec<String>>,
    logs: Mutex<HashMap<String, String>>,
    deleted_jobs: AtomicUsize,
    deleted_pods: AtomicUsize,
    deleted_claims: AtomicUsize,
}

impl FakeClusterApi {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_statuses(&self, statuses: &[ClusterJobStatus]) {
        *self.statuses.lock().unwrap() = statuses.iter().copied().collect();
    }

    fn set_log(&self, container: &str, text: &str) {
        self.logs
            .lock()
            .unwrap()
            .insert(container.to_string(), text.to_string());
    }
}

impl ClusterApi for FakeClusterApi {
    fn create_job<'a>(&'a self, spec: &'a JobSpec) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            self.submitted.lock().unwrap().push(spec.name.clone());
            Ok(())
        })
    }

    fn read_job_status<'a>(&'a self, _name: &'a str) -> ClusterFuture<'a, ClusterJobStatus> {
        Box::pin(async move {
            let mut statuses = self.statuses.lock().unwrap();
            Ok(if statuses.len() > 1 {
                statuses.pop_front().unwrap()
            } else {
                statuses.front().copied().unwrap_or_default()
            })
        })
    }

    fn list_pods<'a>(&'a self, job_id: &'a str) -> ClusterFuture<'a, Vec<PodRef>> {
        Box::pin(async move {
            Ok(vec![PodRef {
                name: format!("job-{job_id}-pod-0"),
            }])
        })
    }

    fn pod_logs<'a>(
        &'a self,
        _pod: &'a PodRef,
        container: &'a str,
    ) -> ClusterFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.logs.lock().unwrap().get(container).cloned()) })
    }

    fn delete_job<'a>(&'a self, _name: &'a str) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            self.deleted_jobs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn delete_pods<'a>(&'a self, _job_id: &'a str) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            self.deleted_pods.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn delete_volume_claim<'a>(&'a self, _name: &'a str) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            self.deleted_claims.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

// =============================================================================
// Recording continuation sink
// =============================================================================

#[derive(Default)]
struct RecordingSink {
    dispatched: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn dispatched(&self) -> Vec<(String, String)> {
        self.dispatched.lock().unwrap().clone()
    }
}

impl ContinuationSink for RecordingSink {
    fn dispatch(&self, job_id: &JobId, continuation: &Continuation) {
        self.dispatched
            .lock()
            .unwrap()
            .push((job_id.to_string(), continuation.0.clone()));
    }
}

// =============================================================================
// Worlds
// =============================================================================

struct LocalWorld {
    store: Arc<JobStore>,
    object_store: Arc<InMemoryObjectStore>,
    runtime: Arc<FakeContainerRuntime>,
    sink: Arc<RecordingSink>,
    locks: LockManager,
    runner: JobRunner,
}

fn local_world(configure: impl FnOnce(&mut ComponentsSettings)) -> LocalWorld {
    let mut settings = ComponentsSettings::default();
    configure(&mut settings);
    let settings = Arc::new(settings);
    let store = JobStore::new();
    let object_store = InMemoryObjectStore::new();
    let runtime = FakeContainerRuntime::new();
    let sink = RecordingSink::new();
    let locks = LockManager::new();
    let factory = ExecutorFactory::new(
        Arc::clone(&settings),
        object_store.clone(),
        BackendHandles::Local(runtime.clone()),
    );
    let runner = JobRunner::new(
        settings,
        Arc::clone(&store),
        locks.clone(),
        factory,
        sink.clone(),
    );
    LocalWorld {
        store,
        object_store,
        runtime,
        sink,
        locks,
        runner,
    }
}

struct ClusterWorld {
    store: Arc<JobStore>,
    object_store: Arc<InMemoryObjectStore>,
    api: Arc<FakeClusterApi>,
    runner: JobRunner,
}

fn cluster_world() -> ClusterWorld {
    let mut settings = ComponentsSettings::default();
    settings.cluster_poll_interval = Duration::from_millis(1);
    let settings = Arc::new(settings);
    let store = JobStore::new();
    let object_store = InMemoryObjectStore::new();
    let api = FakeClusterApi::new();
    let factory = ExecutorFactory::new(
        Arc::clone(&settings),
        object_store.clone(),
        BackendHandles::Cluster(api.clone()),
    );
    let runner = JobRunner::new(
        settings,
        Arc::clone(&store),
        LockManager::new(),
        factory,
        RecordingSink::new(),
    );
    ClusterWorld {
        store,
        object_store,
        api,
        runner,
    }
}

fn interface(slug: &str, kind: InterfaceKind, path: &str) -> ComponentInterface {
    ComponentInterface::new(slug, kind, path).unwrap()
}

fn submit_pending(store: &JobStore, job: Job) -> JobId {
    let mut job = job;
    job.status = JobStatus::Pending;
    let id = job.id;
    assert!(store.insert(job));
    id
}

/// Writes the output a succeeding cluster job would have uploaded.
async fn seed_cluster_output(world: &ClusterWorld, id: &JobId, relative: &str, data: &[u8]) {
    let prefix = crucible::JobPrefix::new(&id.to_string()).unwrap();
    world
        .object_store
        .put(
            "crucible-outputs",
            &prefix.key(relative),
            Bytes::copy_from_slice(data),
        )
        .await
        .unwrap();
}

// =============================================================================
// Local backend scenarios
// =============================================================================

#[tokio::test]
async fn test_local_success_collects_all_output_kinds() {
    let world = local_world(|_| {});
    world.runtime.write_output("results.bin", b"raw bytes");
    world
        .runtime
        .write_output("metrics.json", br#"{"dice": 0.91, "outliers": NaN}"#);
    world.runtime.write_output("images/heatmap/overlay.png", PNG_MAGIC);
    world.runtime.set_exit(0, &["processed 10 slices"], &[]);

    let job = Job::new("alice", "algo:v1")
        .with_output_interfaces(vec![
            interface("raw-results", InterfaceKind::File, "results.bin"),
            interface("metrics", InterfaceKind::Json, "metrics.json"),
            interface("heatmap", InterfaceKind::Image, "images/heatmap"),
        ])
        .with_on_success(Continuation("notify-ok".to_string()));
    let id = submit_pending(&world.store, job);

    let outcome = world.runner.execute_job(&id).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed);

    let job = world.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.outputs.len(), 3);
    assert!(job.stdout.contains("processed 10 slices"));
    assert!(job.error_message.is_none());
    assert!(job.time_limit.is_some());

    // File outputs round-trip byte-identically through staging.
    let raw = job
        .outputs
        .iter()
        .find(|o| o.interface.slug == "raw-results")
        .unwrap();
    assert!(matches!(&raw.value, InterfaceValue::File(data) if &data[..] == b"raw bytes"));

    // Non-finite JSON literals are coerced to null before parsing.
    let metrics = job
        .outputs
        .iter()
        .find(|o| o.interface.slug == "metrics")
        .unwrap();
    let InterfaceValue::Json(value) = &metrics.value else {
        panic!("metrics should be JSON");
    };
    assert_eq!(value["dice"], 0.91);
    assert!(value["outliers"].is_null());

    // Continuation dispatched exactly once.
    assert_eq!(
        world.sink.dispatched(),
        vec![(id.to_string(), "notify-ok".to_string())]
    );
}

#[tokio::test]
async fn test_local_algorithm_container_is_hardened() {
    let world = local_world(|settings| {
        settings.pids_limit = 64;
    });
    world.runtime.set_exit(0, &[], &[]);
    let id = submit_pending(&world.store, Job::new("alice", "algo:v1"));

    world.runner.execute_job(&id).await.unwrap();

    let spec = world
        .runtime
        .last_algorithm_spec
        .lock()
        .unwrap()
        .clone()
        .expect("algorithm container should have run");
    assert!(spec.network_disabled);
    assert!(spec.cap_drop_all);
    assert!(spec.no_new_privileges);
    assert_eq!(spec.pids_limit, 64);
    // Input mounted read-only, output writable.
    let input = spec.mounts.iter().find(|m| m.target == "/input").unwrap();
    let output = spec.mounts.iter().find(|m| m.target == "/output").unwrap();
    assert!(input.read_only);
    assert!(!output.read_only);
}

#[tokio::test]
async fn test_empty_image_directory_fails_the_job() {
    let world = local_world(|_| {});
    world.runtime.set_exit(0, &[], &[]);

    let job = Job::new("alice", "algo:v1")
        .with_output_interfaces(vec![interface("heatmap", InterfaceKind::Image, "images/heatmap")])
        .with_on_failure(Continuation("notify-fail".to_string()));
    let id = submit_pending(&world.store, job);

    let outcome = world.runner.execute_job(&id).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Failed);

    let job = world.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert!(job.error_message.as_deref().unwrap().contains("is empty"));
    assert!(job.outputs.is_empty());
    assert_eq!(
        world.sink.dispatched(),
        vec![(id.to_string(), "notify-fail".to_string())]
    );
}

#[tokio::test]
async fn test_multiple_images_fail_the_job() {
    let world = local_world(|_| {});
    world.runtime.write_output("images/heatmap/a.png", PNG_MAGIC);
    world.runtime.write_output("images/heatmap/b.png", PNG_MAGIC);
    world.runtime.set_exit(0, &[], &[]);

    let job = Job::new("alice", "algo:v1")
        .with_output_interfaces(vec![interface("heatmap", InterfaceKind::Image, "images/heatmap")]);
    let id = submit_pending(&world.store, job);

    world.runner.execute_job(&id).await.unwrap();
    let job = world.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert!(job.error_message.as_deref().unwrap().contains("Only 1 image"));
}

#[tokio::test]
async fn test_missing_declared_output_fails_the_job() {
    let world = local_world(|_| {});
    world.runtime.set_exit(0, &[], &[]);

    let job = Job::new("alice", "algo:v1")
        .with_output_interfaces(vec![interface("metrics", InterfaceKind::Json, "metrics.json")]);
    let id = submit_pending(&world.store, job);

    world.runner.execute_job(&id).await.unwrap();
    let job = world.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert!(job.error_message.as_deref().unwrap().contains("not produced"));
}

#[tokio::test]
async fn test_nonzero_exit_fails_with_stderr_tail_and_cleans_up() {
    let world = local_world(|_| {});
    world
        .runtime
        .set_exit(7, &["partial progress"], &["Traceback", "ValueError: bad input"]);

    let id = submit_pending(&world.store, Job::new("alice", "algo:v1"));
    let outcome = world.runner.execute_job(&id).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Failed);

    let job = world.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    let message = job.error_message.as_deref().unwrap();
    assert!(message.contains("exit code 7"));
    assert!(message.contains("ValueError: bad input"));
    assert!(job.stderr.contains("Traceback"));
    assert!(job.stdout.contains("partial progress"));

    // Both per-job volumes were torn down and nothing is left running.
    assert_eq!(world.runtime.removed_volumes.lock().unwrap().len(), 2);
    assert!(world.runtime.live_containers.lock().unwrap().is_empty());
    assert!(world.runtime.live_volumes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_deprovision_runs_once_per_bucket_and_clears_staging() {
    let world = local_world(|_| {});
    world.runtime.set_exit(0, &[], &[]);

    let input = ComponentInterfaceValue::new(
        interface("scan", InterfaceKind::File, "scan.dat"),
        InterfaceValue::File(Bytes::from_static(b"voxels")),
    );
    let id = submit_pending(
        &world.store,
        Job::new("alice", "algo:v1").with_inputs(vec![input]),
    );

    world.runner.execute_job(&id).await.unwrap();

    // One prefix deletion per configured bucket, and no staged objects left.
    assert_eq!(world.object_store.delete_prefix_calls(), 2);
    assert!(world.object_store.is_empty());
}

#[tokio::test]
async fn test_prune_contention_is_retried() {
    let world = local_world(|_| {});
    world.runtime.set_exit(0, &[], &[]);
    world.runtime.contend_prunes(2);

    let id = submit_pending(&world.store, Job::new("alice", "algo:v1"));
    let outcome = world.runner.execute_job(&id).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed);
    assert_eq!(world.runtime.prune_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_execute_is_idempotent() {
    let world = local_world(|_| {});
    world.runtime.set_exit(0, &[], &[]);
    let id = submit_pending(&world.store, Job::new("alice", "algo:v1"));

    assert_eq!(
        world.runner.execute_job(&id).await.unwrap(),
        ExecutionOutcome::Completed
    );
    // Redelivery of the same unit of work is absorbed without side effects.
    assert_eq!(
        world.runner.execute_job(&id).await.unwrap(),
        ExecutionOutcome::Skipped
    );
    assert_eq!(world.object_store.delete_prefix_calls(), 2);
}

#[tokio::test]
async fn test_lock_contention_is_retryable_and_leaves_job_pending() {
    let world = local_world(|_| {});
    let id = submit_pending(&world.store, Job::new("alice", "algo:v1"));

    let _held = world
        .locks
        .try_lock(crucible::lock::row_key("components", "job", &id.to_string()))
        .unwrap();

    let err = world.runner.execute_job(&id).await.unwrap_err();
    assert!(matches!(err, DispatchError::Lock(_)));
    assert!(err.is_retryable());
    assert_eq!(world.store.get(&id).unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_global_admission_ceiling_defers_execution() {
    let world = local_world(|settings| {
        settings.max_active_jobs = 1;
    });

    let mut occupying = Job::new("bob", "algo:v1");
    occupying.status = JobStatus::Started;
    world.store.insert(occupying);

    let id = submit_pending(&world.store, Job::new("alice", "algo:v1"));
    let err = world.runner.execute_job(&id).await.unwrap_err();
    assert!(matches!(err, DispatchError::Admission(_)));
    assert!(err.is_retryable());
    assert_eq!(world.store.get(&id).unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_per_creator_ceiling_does_not_block_other_creators() {
    let world = local_world(|settings| {
        settings.max_active_jobs_per_creator = 1;
    });
    world.runtime.set_exit(0, &[], &[]);

    let mut occupying = Job::new("alice", "algo:v1");
    occupying.status = JobStatus::Started;
    world.store.insert(occupying);

    let alice = submit_pending(&world.store, Job::new("alice", "algo:v1"));
    let bob = submit_pending(&world.store, Job::new("bob", "algo:v1"));

    let err = world.runner.execute_job(&alice).await.unwrap_err();
    assert!(matches!(err, DispatchError::Admission(_)));

    assert_eq!(
        world.runner.execute_job(&bob).await.unwrap(),
        ExecutionOutcome::Completed
    );
}

// =============================================================================
// Cluster backend scenarios
// =============================================================================

#[tokio::test]
async fn test_cluster_success_via_polling() {
    let world = cluster_world();
    world.api.script_statuses(&[
        ClusterJobStatus {
            active: 1,
            ..Default::default()
        },
        ClusterJobStatus {
            succeeded: 1,
            ..Default::default()
        },
    ]);
    world.api.set_log("main", "epoch 1\nepoch 2");
    world.api.set_log("input", "downloaded 3 objects");

    let job = Job::new("alice", "algo:v1")
        .with_output_interfaces(vec![interface("metrics", InterfaceKind::Json, "metrics.json")]);
    let id = submit_pending(&world.store, job);
    seed_cluster_output(&world, &id, "metrics.json", br#"{"dice": 0.8}"#).await;

    let outcome = world.runner.execute_job(&id).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed);

    let job = world.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert!(job.stdout.contains("epoch 2"));
    // Helper container logs land in stderr, tagged by container.
    assert!(job.stderr.contains("[input] downloaded 3 objects"));

    assert_eq!(world.api.submitted.lock().unwrap().len(), 1);
    // Pods, job resource, and volume claim all deleted on deprovision.
    assert_eq!(world.api.deleted_pods.load(Ordering::SeqCst), 1);
    assert_eq!(world.api.deleted_jobs.load(Ordering::SeqCst), 1);
    assert_eq!(world.api.deleted_claims.load(Ordering::SeqCst), 1);
    assert_eq!(world.object_store.delete_prefix_calls(), 2);
}

#[tokio::test]
async fn test_cluster_failure_via_polling() {
    let world = cluster_world();
    world.api.script_statuses(&[ClusterJobStatus {
        failed: 1,
        ..Default::default()
    }]);

    let id = submit_pending(&world.store, Job::new("alice", "algo:v1"));
    let outcome = world.runner.execute_job(&id).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Failed);

    let job = world.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert!(job.error_message.is_some());
    // Cleanup still ran.
    assert_eq!(world.api.deleted_jobs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cluster_completion_event_finishes_started_job() {
    let world = cluster_world();
    let job = Job::new("alice", "algo:v1")
        .with_output_interfaces(vec![interface("metrics", InterfaceKind::Json, "metrics.json")]);
    let id = submit_pending(&world.store, job);
    world.store.ensure_time_limit(&id, Duration::from_secs(60)).unwrap();
    assert!(world.store.mark_started(&id).unwrap());
    seed_cluster_output(&world, &id, "metrics.json", br#"{"dice": 0.8}"#).await;

    let outcome = world
        .runner
        .handle_event(
            &id,
            ExecutorEvent::JobCompleted {
                succeeded: true,
                message: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed);
    assert_eq!(world.store.get(&id).unwrap().status, JobStatus::Success);
    assert_eq!(world.api.deleted_claims.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cluster_failure_event_carries_backend_message() {
    let world = cluster_world();
    let id = submit_pending(&world.store, Job::new("alice", "algo:v1"));
    world.store.ensure_time_limit(&id, Duration::from_secs(60)).unwrap();
    assert!(world.store.mark_started(&id).unwrap());

    let outcome = world
        .runner
        .handle_event(
            &id,
            ExecutorEvent::JobCompleted {
                succeeded: false,
                message: Some("OOMKilled".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Failed);

    let job = world.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert!(job.error_message.as_deref().unwrap().contains("OOMKilled"));
}

#[tokio::test]
async fn test_event_for_unstarted_job_is_skipped() {
    let world = cluster_world();
    let id = submit_pending(&world.store, Job::new("alice", "algo:v1"));

    let outcome = world
        .runner
        .handle_event(
            &id,
            ExecutorEvent::JobCompleted {
                succeeded: true,
                message: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Skipped);
    assert_eq!(world.store.get(&id).unwrap().status, JobStatus::Pending);
}

// =============================================================================
// Time limit
// =============================================================================

#[tokio::test]
async fn test_time_limit_bounds_execution() {
    let world = cluster_world();
    // Status never reaches a completion condition, so the poll loop would
    // spin forever without the surrounding limit.
    world.api.script_statuses(&[ClusterJobStatus {
        active: 1,
        ..Default::default()
    }]);

    let job = Job::new("alice", "algo:v1").with_time_limit(Duration::from_secs(1));
    let id = submit_pending(&world.store, job);

    let outcome = world.runner.execute_job(&id).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Failed);

    let job = world.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(job.error_message.as_deref(), Some("time limit exceeded"));
    // Cluster resources were still torn down after the timeout.
    assert_eq!(world.api.deleted_jobs.load(Ordering::SeqCst), 1);
}
