use super::context::TaskContext;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// How a running task should be handled when its node drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownBehavior {
    /// The task's cancellation token fires; a task that stops early is handed
    /// back to the queue without consuming a retry.
    #[default]
    Cancellable,
    /// Wait (up to the drain timeout) for the task to complete.
    WaitForCompletion,
}

/// Errors a task handler can return.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// Retried with backoff while the job has retries left.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    /// Fails the job without retry.
    #[error("Permanent failure: {0}")]
    Permanent(String),
    /// The handler observed its cancellation token and stopped.
    #[error("Task was cancelled")]
    Cancelled,
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::ExecutionFailed(_))
    }
}

/// A kind of job the scheduler can run, registered under a unique task name.
///
/// Handlers are executed synchronously from a blocking context using
/// `spawn_blocking`. Long-running handlers should check `ctx.is_cancelled()`
/// between units of work and return `TaskError::Cancelled` when it is set.
pub trait TaskHandler: Send + Sync {
    /// Task name jobs refer to. Must match `[A-Za-z0-9_.-]+`.
    fn name(&self) -> &'static str;

    /// Description of what this task does.
    fn description(&self) -> &'static str;

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    /// Check a job's arguments. Runs at submission (when the task is
    /// registered on the submitting node) and again before execution.
    fn validate_args(&self, _args: &JsonValue) -> Result<(), TaskError> {
        Ok(())
    }

    /// Run the job. The returned value is stored as the job's result.
    fn execute(&self, ctx: &TaskContext, args: &JsonValue)
        -> Result<Option<JsonValue>, TaskError>;
}
