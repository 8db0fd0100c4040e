use super::task::TaskError;
use crate::job_store::{Claim, JobStore, JobStoreError};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a job's cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel` was called on the job.
    Requested,
    /// The node is draining.
    Shutdown,
    /// The per-job execution timeout expired.
    Timeout,
    /// Another node now owns the job; any result must be discarded.
    Fenced,
}

/// Cancellation token of one execution, remembering the first reason it fired for.
#[derive(Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Writes progress lines for a claimed job, fenced by the claim's version.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    claim: Claim,
    cancel: CancelHandle,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, claim: Claim, cancel: CancelHandle) -> Self {
        Self {
            store,
            claim,
            cancel,
        }
    }

    /// Append a progress line and refresh the job's heartbeat.
    ///
    /// Returns `TaskError::Cancelled` when the claim is stale: the handler
    /// must stop, its work now belongs to another node. Transient store
    /// errors are logged and swallowed.
    pub fn report(&self, line: &str) -> Result<(), TaskError> {
        match self
            .store
            .heartbeat_progress(&self.claim.job_id, self.claim.version, Some(line))
        {
            Ok(ack) => {
                if ack.cancel_requested && !self.cancel.is_cancelled() {
                    debug!("Job {} has a pending cancel request", self.claim.job_id);
                    self.cancel.cancel(CancelReason::Requested);
                }
                Ok(())
            }
            Err(e @ (JobStoreError::StaleClaim { .. } | JobStoreError::NotFound(_))) => {
                warn!("Stopping job {}: {}", self.claim.job_id, e);
                self.cancel.cancel(CancelReason::Fenced);
                Err(TaskError::Cancelled)
            }
            Err(e) => {
                warn!(
                    "Failed to record progress for job {}: {}",
                    self.claim.job_id, e
                );
                Ok(())
            }
        }
    }
}

/// Context handed to a task handler for one execution.
///
/// Carries the job's identity, its cancellation token, a progress reporter
/// and the tracing span the execution runs in.
pub struct TaskContext {
    pub job_id: String,
    pub group_id: String,
    pub node_id: String,
    /// 1 for the first run, incremented by every retry.
    pub attempt: u32,
    cancel: CancelHandle,
    progress: ProgressReporter,
    span: tracing::Span,
}

impl TaskContext {
    pub fn new(
        claim: Claim,
        attempt: u32,
        cancel: CancelHandle,
        progress: ProgressReporter,
        span: tracing::Span,
    ) -> Self {
        Self {
            job_id: claim.job_id,
            group_id: claim.group_id,
            node_id: claim.node_id,
            attempt,
            cancel,
            progress,
            span,
        }
    }

    /// Check if cancellation has been requested.
    ///
    /// Handlers should check this between units of work and return
    /// `TaskError::Cancelled` if true.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel.reason()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        self.cancel.token()
    }

    /// See [`ProgressReporter::report`].
    pub fn report_progress(&self, line: &str) -> Result<(), TaskError> {
        self.progress.report(line)
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::{JobState, NewJob, SqliteJobStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn running_job(store: &Arc<dyn JobStore>) -> Claim {
        store.insert(NewJob::new("t", "g", json!(null))).unwrap();
        store
            .claim_next("node-a", None)
            .unwrap()
            .unwrap()
            .claim()
            .unwrap()
    }

    fn make_store() -> (Arc<dyn JobStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap();
        (Arc::new(store), temp_dir)
    }

    #[test]
    fn test_first_cancel_reason_wins() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());
        assert_eq!(handle.reason(), None);

        handle.cancel(CancelReason::Shutdown);
        handle.cancel(CancelReason::Fenced);
        assert!(handle.is_cancelled());
        assert!(handle.token().is_cancelled());
        assert_eq!(handle.reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_report_progress_writes_log() {
        let (store, _temp_dir) = make_store();
        let claim = running_job(&store);
        let cancel = CancelHandle::new();
        let reporter = ProgressReporter::new(store.clone(), claim.clone(), cancel.clone());

        reporter.report("10%").unwrap();
        assert!(!cancel.is_cancelled());

        let job = store.get(&claim.job_id).unwrap().unwrap();
        assert_eq!(job.progress.as_deref(), Some("10%"));
    }

    #[test]
    fn test_report_observes_cancel_request() {
        let (store, _temp_dir) = make_store();
        let claim = running_job(&store);
        let cancel = CancelHandle::new();
        let reporter = ProgressReporter::new(store.clone(), claim.clone(), cancel.clone());

        store.request_cancel(&claim.job_id).unwrap();
        reporter.report("still going").unwrap();
        assert_eq!(cancel.reason(), Some(CancelReason::Requested));
    }

    #[test]
    fn test_report_on_stale_claim_fences_handler() {
        let (store, _temp_dir) = make_store();
        let claim = running_job(&store);
        let cancel = CancelHandle::new();
        let reporter = ProgressReporter::new(store.clone(), claim.clone(), cancel.clone());

        // Another node's sweep takes the job away
        store.release(&claim.job_id, claim.version).unwrap();
        assert_eq!(
            store.get(&claim.job_id).unwrap().unwrap().state,
            JobState::Waiting
        );

        assert_eq!(reporter.report("late"), Err(TaskError::Cancelled));
        assert_eq!(cancel.reason(), Some(CancelReason::Fenced));

        let ctx = TaskContext::new(claim, 1, cancel, reporter, tracing::Span::none());
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.cancel_reason(), Some(CancelReason::Fenced));
    }
}
