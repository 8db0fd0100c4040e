//! Shared helpers for integration tests.
//!
//! Every "node" in these tests is its own `SqliteJobStore` instance opened on
//! the same database file inside a `TempDir`.

#![allow(dead_code)]

use doc_job_scheduler::config::SchedulerSettings;
use doc_job_scheduler::job_store::{
    Job, JobState, JobStore, NodeInfo, RetryPolicy, SqliteJobStore,
};
use doc_job_scheduler::scheduler::{
    create_scheduler, DrainReport, SchedulerHandle, ShutdownBehavior, TaskContext, TaskError,
    TaskHandler, TaskRegistry,
};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn db_path(temp_dir: &TempDir) -> PathBuf {
    temp_dir.path().join("jobs.db")
}

/// A store that requeues failed jobs without backoff.
pub fn open_store(path: &Path) -> Arc<SqliteJobStore> {
    Arc::new(
        SqliteJobStore::new(path)
            .unwrap()
            .with_retry_policy(RetryPolicy::immediate()),
    )
}

pub fn fast_settings() -> SchedulerSettings {
    SchedulerSettings {
        workers: 2,
        poll_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(500),
        sweep_interval: Duration::from_millis(100),
        periodic_interval: Duration::from_millis(100),
        drain_timeout: Duration::from_secs(5),
        job_timeout: None,
        default_max_retries: 3,
        groups: Vec::new(),
    }
}

/// Register a node whose last heartbeat is far in the past.
pub fn register_dead_node(store: &dyn JobStore, node_id: &str) {
    let mut node = NodeInfo::new(node_id, "gone-host", 1);
    node.last_heartbeat -= 60_000;
    store.register_node(&node).unwrap();
}

/// Poll the store until the job reaches `state`.
pub async fn wait_for_state(store: &dyn JobStore, job_id: &str, state: JobState) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = store.get(job_id).unwrap().unwrap();
        if job.state == state {
            return job;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "job {} never reached {:?}, last state {:?}",
                job_id, state, job.state
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Returns its arguments as the result.
pub struct EchoTask;

impl TaskHandler for EchoTask {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn description(&self) -> &'static str {
        "Returns its arguments"
    }

    fn execute(&self, _ctx: &TaskContext, args: &JsonValue) -> Result<Option<JsonValue>, TaskError> {
        Ok(Some(args.clone()))
    }
}

/// Fails every attempt with a retryable error.
#[derive(Default)]
pub struct FlakyTask {
    pub attempts: Arc<AtomicUsize>,
}

impl TaskHandler for FlakyTask {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn description(&self) -> &'static str {
        "Always fails"
    }

    fn execute(&self, _ctx: &TaskContext, _args: &JsonValue) -> Result<Option<JsonValue>, TaskError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TaskError::ExecutionFailed("storage unavailable".to_string()))
    }
}

/// Runs until cancelled, checking the token every 10ms.
pub struct WaitForCancelTask;

impl TaskHandler for WaitForCancelTask {
    fn name(&self) -> &'static str {
        "wait_for_cancel"
    }

    fn description(&self) -> &'static str {
        "Runs until cancelled"
    }

    fn execute(&self, ctx: &TaskContext, _args: &JsonValue) -> Result<Option<JsonValue>, TaskError> {
        for _ in 0..1000 {
            if ctx.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(None)
    }
}

/// Sleeps `args.ms` milliseconds and is never cancelled by a drain.
pub struct SleepTask;

impl TaskHandler for SleepTask {
    fn name(&self) -> &'static str {
        "sleep"
    }

    fn description(&self) -> &'static str {
        "Sleeps for a while"
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::WaitForCompletion
    }

    fn execute(&self, _ctx: &TaskContext, args: &JsonValue) -> Result<Option<JsonValue>, TaskError> {
        let ms = args.get("ms").and_then(JsonValue::as_u64).unwrap_or(100);
        std::thread::sleep(Duration::from_millis(ms));
        Ok(None)
    }
}

/// Stands in for a handler deployed on only some nodes.
pub struct TrainClassifierTask;

impl TaskHandler for TrainClassifierTask {
    fn name(&self) -> &'static str {
        "train_classifier"
    }

    fn description(&self) -> &'static str {
        "Only registered on some nodes"
    }

    fn execute(&self, _ctx: &TaskContext, _args: &JsonValue) -> Result<Option<JsonValue>, TaskError> {
        Ok(Some(JsonValue::from("trained")))
    }
}

/// Records the highest number of concurrent executions it has seen.
#[derive(Default)]
pub struct OverlapCounter {
    pub active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
}

impl TaskHandler for OverlapCounter {
    fn name(&self) -> &'static str {
        "count_overlap"
    }

    fn description(&self) -> &'static str {
        "Tracks overlapping executions"
    }

    fn execute(&self, _ctx: &TaskContext, _args: &JsonValue) -> Result<Option<JsonValue>, TaskError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }
}

/// Handlers shared by every node of a test.
#[derive(Clone)]
pub struct TestTasks {
    pub flaky: Arc<FlakyTask>,
    pub overlap: Arc<OverlapCounter>,
}

impl TestTasks {
    pub fn new() -> Self {
        Self {
            flaky: Arc::new(FlakyTask::default()),
            overlap: Arc::new(OverlapCounter::default()),
        }
    }

    pub fn registry(&self) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(EchoTask)).unwrap();
        registry.register(Arc::new(WaitForCancelTask)).unwrap();
        registry.register(Arc::new(SleepTask)).unwrap();
        registry.register(self.flaky.clone()).unwrap();
        registry.register(self.overlap.clone()).unwrap();
        registry
    }
}

/// A coordinator running in the background.
pub struct TestNode {
    pub handle: SchedulerHandle,
    pub shutdown_token: CancellationToken,
    join: JoinHandle<anyhow::Result<DrainReport>>,
}

impl TestNode {
    pub fn start(
        store: Arc<SqliteJobStore>,
        node_id: &str,
        settings: SchedulerSettings,
        tasks: &TestTasks,
    ) -> Self {
        Self::start_with_registry(store, node_id, settings, tasks.registry())
    }

    pub fn start_with_registry(
        store: Arc<SqliteJobStore>,
        node_id: &str,
        settings: SchedulerSettings,
        registry: TaskRegistry,
    ) -> Self {
        let shutdown_token = CancellationToken::new();
        let (scheduler, handle) = create_scheduler(
            store,
            registry,
            settings,
            node_id.to_string(),
            &[],
            shutdown_token.clone(),
        )
        .unwrap();
        let join = tokio::spawn(scheduler.run());
        Self {
            handle,
            shutdown_token,
            join,
        }
    }

    /// Cancel the node and wait for its drain to finish.
    pub async fn stop(self) -> DrainReport {
        self.shutdown_token.cancel();
        self.join.await.unwrap().unwrap()
    }
}
