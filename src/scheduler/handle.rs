use super::registry::{validate_task_name, TaskRegistry};
use crate::job_store::{
    now_millis, CancelOutcome, Job, JobFilter, JobLogEntry, JobState, JobStore, JobStoreError,
    JobStoreResult, NewJob, NodeInfo, PeriodicTask,
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::info;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid job: {0}")]
    Validation(String),
    #[error("Unknown task: {0}")]
    UnknownTask(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// A job submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub task_name: String,
    pub group_id: String,
    pub priority: i32,
    pub args: JsonValue,
    /// Earliest start; `None` runs as soon as a worker is free.
    pub schedule_at: Option<DateTime<Utc>>,
    /// Defaults to the scheduler's `default_max_retries`.
    pub max_retries: Option<u32>,
}

impl SubmitRequest {
    pub fn new(task_name: impl Into<String>, group_id: impl Into<String>, args: JsonValue) -> Self {
        Self {
            task_name: task_name.into(),
            group_id: group_id.into(),
            priority: 0,
            args,
            schedule_at: None,
            max_retries: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_at = Some(at);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Handle for submitting, cancelling and inspecting jobs.
///
/// Cheap to clone. Every operation goes straight to the shared store, so a
/// handle works the same whether or not the local coordinator is running.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    wakeup: Arc<Notify>,
    default_max_retries: u32,
}

impl SchedulerHandle {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<TaskRegistry>,
        wakeup: Arc<Notify>,
        default_max_retries: u32,
    ) -> Self {
        Self {
            store,
            registry,
            wakeup,
            default_max_retries,
        }
    }

    /// Validate and enqueue a job, returning its id.
    ///
    /// The task must be registered on this node, and its argument check runs
    /// too. Nodes only claim jobs for tasks they have registered, so in a
    /// mixed deployment a job waits until a node that handles it is up.
    pub fn submit(&self, request: SubmitRequest) -> Result<String, SubmitError> {
        validate_task_name(&request.task_name).map_err(|reason| {
            SubmitError::Validation(format!("task name '{}': {}", request.task_name, reason))
        })?;
        if request.group_id.trim().is_empty() {
            return Err(SubmitError::Validation(
                "group must not be empty".to_string(),
            ));
        }
        let Some(handler) = self.registry.get(&request.task_name) else {
            return Err(SubmitError::UnknownTask(request.task_name));
        };
        handler
            .validate_args(&request.args)
            .map_err(|e| SubmitError::Validation(e.to_string()))?;

        let schedule_at = request.schedule_at.map(|at| at.timestamp_millis());
        let mut new_job = NewJob::new(request.task_name, request.group_id, request.args)
            .priority(request.priority)
            .max_retries(request.max_retries.unwrap_or(self.default_max_retries));
        if let Some(at) = schedule_at {
            new_job = new_job.schedule_at(at);
        }
        let task_name = new_job.task_name.clone();
        let group_id = new_job.group_id.clone();

        let job_id = self.store.insert(new_job)?;
        info!(
            "Submitted job {} (task: {}, group: {})",
            job_id, task_name, group_id
        );

        if schedule_at.map_or(true, |at| at <= now_millis()) {
            self.wakeup.notify_one();
        }
        Ok(job_id)
    }

    /// Cancel a pending job, or ask a running one to stop.
    pub fn cancel(&self, job_id: &str) -> JobStoreResult<CancelOutcome> {
        let outcome = self.store.request_cancel(job_id)?;
        info!("Cancel request for job {}: {:?}", job_id, outcome);
        if outcome == CancelOutcome::CancelRequested {
            // Lets the local coordinator signal the handler without waiting for a heartbeat
            self.wakeup.notify_one();
        }
        Ok(outcome)
    }

    pub fn get_job(&self, job_id: &str) -> JobStoreResult<Option<Job>> {
        self.store.get(job_id)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> JobStoreResult<Vec<Job>> {
        self.store.list(filter)
    }

    pub fn job_logs(&self, job_id: &str, limit: usize) -> JobStoreResult<Vec<JobLogEntry>> {
        self.store.job_logs(job_id, limit)
    }

    /// Job counts for every state, zero included.
    pub fn job_counts(&self) -> JobStoreResult<Vec<(JobState, usize)>> {
        let counts = self.store.count_by_state()?;
        Ok(JobState::ALL
            .iter()
            .map(|state| {
                let count = counts
                    .iter()
                    .find(|(s, _)| s == state)
                    .map(|(_, c)| *c)
                    .unwrap_or(0);
                (*state, count)
            })
            .collect())
    }

    pub fn list_nodes(&self) -> JobStoreResult<Vec<NodeInfo>> {
        self.store.list_nodes()
    }

    pub fn list_periodic_tasks(&self) -> JobStoreResult<Vec<PeriodicTask>> {
        self.store.list_periodic_tasks()
    }

    /// Task names this node can execute.
    pub fn registered_tasks(&self) -> Vec<String> {
        self.registry.names().into_iter().map(String::from).collect()
    }

    /// Nudge the local coordinator to look for work now.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::SqliteJobStore;
    use crate::scheduler::{TaskContext, TaskError, TaskHandler};
    use serde_json::json;
    use tempfile::TempDir;

    struct ConvertTask;

    impl TaskHandler for ConvertTask {
        fn name(&self) -> &'static str {
            "convert_pdf"
        }

        fn description(&self) -> &'static str {
            "Converts a document to PDF"
        }

        fn validate_args(&self, args: &JsonValue) -> Result<(), TaskError> {
            match args.get("document_id") {
                Some(JsonValue::Number(_)) => Ok(()),
                _ => Err(TaskError::InvalidArgs(
                    "document_id must be a number".to_string(),
                )),
            }
        }

        fn execute(
            &self,
            _ctx: &TaskContext,
            _args: &JsonValue,
        ) -> Result<Option<JsonValue>, TaskError> {
            Ok(None)
        }
    }

    fn make_handle() -> (SchedulerHandle, Arc<Notify>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap());
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(ConvertTask)).unwrap();
        let wakeup = Arc::new(Notify::new());
        let handle = SchedulerHandle::new(store, Arc::new(registry), wakeup.clone(), 3);
        (handle, wakeup, temp_dir)
    }

    #[tokio::test]
    async fn test_submit_wakes_coordinator() {
        let (handle, wakeup, _temp_dir) = make_handle();

        let job_id = handle
            .submit(SubmitRequest::new("convert_pdf", "tenant-1", json!({"document_id": 4})).priority(7))
            .unwrap();

        // The permit is stored even though nobody was waiting yet
        tokio::time::timeout(std::time::Duration::from_secs(1), wakeup.notified())
            .await
            .unwrap();

        let job = handle.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.priority, 7);
        assert_eq!(job.max_retries, 3);
    }

    #[test]
    fn test_submit_validation() {
        let (handle, _wakeup, _temp_dir) = make_handle();

        let bad_name = handle.submit(SubmitRequest::new("bad name", "g", json!({})));
        assert!(matches!(bad_name, Err(SubmitError::Validation(_))));

        let empty_group = handle.submit(SubmitRequest::new("convert_pdf", " ", json!({"document_id": 1})));
        assert!(matches!(empty_group, Err(SubmitError::Validation(_))));

        let bad_args = handle.submit(SubmitRequest::new("convert_pdf", "g", json!({"document_id": "x"})));
        match bad_args {
            Err(SubmitError::Validation(msg)) => assert!(msg.contains("document_id")),
            other => panic!("unexpected result: {:?}", other),
        }

        let unknown = handle.submit(SubmitRequest::new("train_classifier", "g", json!(null)));
        match unknown {
            Err(SubmitError::UnknownTask(name)) => assert_eq!(name, "train_classifier"),
            other => panic!("unexpected result: {:?}", other),
        }

        // Nothing reached the store
        assert!(handle.list_jobs(&JobFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_submit_in_future_is_scheduled() {
        let (handle, _wakeup, _temp_dir) = make_handle();
        let at = Utc::now() + chrono::Duration::hours(1);

        let job_id = handle
            .submit(
                SubmitRequest::new("convert_pdf", "g", json!({"document_id": 1}))
                    .schedule_at(at)
                    .max_retries(0),
            )
            .unwrap();

        let job = handle.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.scheduled_at, at.timestamp_millis());
        assert_eq!(job.max_retries, 0);
    }

    #[test]
    fn test_cancel_and_counts() {
        let (handle, _wakeup, _temp_dir) = make_handle();
        let job_id = handle
            .submit(SubmitRequest::new("convert_pdf", "g", json!({"document_id": 1})))
            .unwrap();

        assert_eq!(handle.cancel(&job_id).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            handle.cancel(&job_id).unwrap(),
            CancelOutcome::AlreadyFinished(JobState::Cancelled)
        );
        assert!(matches!(
            handle.cancel("missing"),
            Err(JobStoreError::NotFound(_))
        ));

        let counts = handle.job_counts().unwrap();
        assert_eq!(counts.len(), JobState::ALL.len());
        assert!(counts.contains(&(JobState::Cancelled, 1)));
        assert!(counts.contains(&(JobState::Waiting, 0)));
        assert_eq!(handle.registered_tasks(), vec!["convert_pdf".to_string()]);
    }
}
