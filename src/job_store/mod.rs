//! Durable job queue shared by every scheduler node.
//!
//! All coordination between nodes goes through this store: claims are
//! conditional updates on job rows, fenced by a per-job version counter.

mod error;
mod models;
mod retry_policy;
mod schema;
mod sqlite_job_store;

pub use error::{JobStoreError, JobStoreResult};
pub use models::{
    now_millis, CancelOutcome, Claim, Job, JobFilter, JobLogEntry, JobOutcome, JobState, NewJob,
    NodeInfo, PeriodicTask, PeriodicTaskDefinition, ProgressAck, TriggerOutcome,
};
pub use retry_policy::RetryPolicy;
pub use sqlite_job_store::SqliteJobStore;

/// Storage operations behind the scheduler.
pub trait JobStore: Send + Sync {
    // === Jobs ===

    /// Insert a new job. It starts as `Waiting`, or `Scheduled` when its start
    /// time is in the future.
    ///
    /// Fails with [`JobStoreError::Duplicate`] when an unfinished job spawned by
    /// the same periodic task already exists.
    fn insert(&self, job: NewJob) -> JobStoreResult<String>;

    fn get(&self, job_id: &str) -> JobStoreResult<Option<Job>>;

    fn list(&self, filter: &JobFilter) -> JobStoreResult<Vec<Job>>;

    /// Number of jobs per state. States with no jobs are omitted.
    fn count_by_state(&self) -> JobStoreResult<Vec<(JobState, usize)>>;

    fn job_logs(&self, job_id: &str, limit: usize) -> JobStoreResult<Vec<JobLogEntry>>;

    // === Claim protocol ===

    /// Claim the best eligible job for `node_id` and mark it `Running`.
    ///
    /// Eligible: pending, due, not cancelled, and no other job of its group
    /// running. Order: priority (high first), least recently served group,
    /// submission time. `capable_groups` restricts the groups considered.
    fn claim_next(
        &self,
        node_id: &str,
        capable_groups: Option<&[String]>,
    ) -> JobStoreResult<Option<Job>> {
        self.claim_next_matching(node_id, capable_groups, None)
    }

    /// Like [`JobStore::claim_next`], also restricted to jobs whose task name
    /// is in `task_names`. An empty slice matches nothing.
    fn claim_next_matching(
        &self,
        node_id: &str,
        capable_groups: Option<&[String]>,
        task_names: Option<&[String]>,
    ) -> JobStoreResult<Option<Job>>;

    /// Refresh the job's liveness and optionally append a progress line.
    ///
    /// Fails with [`JobStoreError::StaleClaim`] when `version` is outdated.
    fn heartbeat_progress(
        &self,
        job_id: &str,
        version: i64,
        line: Option<&str>,
    ) -> JobStoreResult<ProgressAck>;

    /// Record the outcome of a run. Returns the state the job ended up in:
    /// `Waiting` when a retryable failure is requeued with backoff.
    fn finish(&self, job_id: &str, version: i64, outcome: JobOutcome) -> JobStoreResult<JobState>;

    /// Hand a claimed job back to `Waiting` without consuming a retry.
    fn release(&self, job_id: &str, version: i64) -> JobStoreResult<()>;

    /// Cancel a pending job, or flag a running one for cooperative cancellation.
    fn request_cancel(&self, job_id: &str) -> JobStoreResult<CancelOutcome>;

    /// Running jobs of `node_id` flagged for cancellation, with their version.
    fn cancel_requested_jobs(&self, node_id: &str) -> JobStoreResult<Vec<(String, i64)>>;

    /// Requeue (or mark `Stuck`) running jobs whose node last heartbeated
    /// before `dead_before`. Returns the number of jobs moved.
    fn reclaim_orphans(&self, dead_before: i64) -> JobStoreResult<usize>;

    // === Nodes ===

    fn register_node(&self, node: &NodeInfo) -> JobStoreResult<()>;

    /// Returns false when the node row no longer exists.
    fn heartbeat_node(&self, node_id: &str) -> JobStoreResult<bool>;

    fn deregister_node(&self, node_id: &str) -> JobStoreResult<()>;

    fn list_nodes(&self) -> JobStoreResult<Vec<NodeInfo>>;

    /// Delete nodes that stopped heartbeating before `dead_before` and own no
    /// running job.
    fn prune_dead_nodes(&self, dead_before: i64) -> JobStoreResult<usize>;

    // === Periodic tasks ===

    /// Insert or update a definition. `next_due` applies to new tasks and to
    /// tasks whose schedule or timezone changed; otherwise the stored cursor
    /// is kept.
    fn upsert_periodic_task(
        &self,
        definition: &PeriodicTaskDefinition,
        next_due: Option<i64>,
    ) -> JobStoreResult<()>;

    fn list_periodic_tasks(&self) -> JobStoreResult<Vec<PeriodicTask>>;

    /// Spawn the job for the due instant `expected_due` and advance the cursor
    /// to `next_due`, atomically. Only one caller per instant gets past the
    /// cursor check.
    fn trigger_periodic(
        &self,
        task_id: &str,
        expected_due: i64,
        next_due: Option<i64>,
        now: i64,
    ) -> JobStoreResult<TriggerOutcome>;
}
