//! Node registry cleanup task.
//!
//! Deletes rows of nodes that stopped heartbeating longer ago than the
//! retention period. Nodes still owning a running job are kept so the orphan
//! sweep can find them.

use crate::job_store::{now_millis, JobStore};
use crate::scheduler::{TaskContext, TaskError, TaskHandler};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::info;

const DEFAULT_RETENTION_HOURS: u64 = 24;

/// Prunes dead nodes from the node table.
///
/// Arguments: `{"retention_hours": <u64>}`, 24 hours when omitted.
pub struct NodeCleanupTask {
    store: Arc<dyn JobStore>,
}

impl NodeCleanupTask {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    fn retention_hours(args: &JsonValue) -> Result<u64, TaskError> {
        match args.get("retention_hours") {
            None | Some(JsonValue::Null) => Ok(DEFAULT_RETENTION_HOURS),
            Some(value) => value.as_u64().ok_or_else(|| {
                TaskError::InvalidArgs(format!(
                    "retention_hours must be a non-negative integer, got {}",
                    value
                ))
            }),
        }
    }
}

impl TaskHandler for NodeCleanupTask {
    fn name(&self) -> &'static str {
        "node_registry_cleanup"
    }

    fn description(&self) -> &'static str {
        "Delete nodes that stopped heartbeating longer ago than the retention period"
    }

    fn validate_args(&self, args: &JsonValue) -> Result<(), TaskError> {
        Self::retention_hours(args).map(|_| ())
    }

    fn execute(&self, ctx: &TaskContext, args: &JsonValue) -> Result<Option<JsonValue>, TaskError> {
        // Check for cancellation before starting
        if ctx.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let retention_hours = Self::retention_hours(args)?;
        let retention_ms = i64::try_from(retention_hours.saturating_mul(60 * 60 * 1000))
            .unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(retention_ms);

        info!(
            "Pruning nodes silent for more than {} hours (cutoff: {})",
            retention_hours, cutoff
        );

        let pruned = self
            .store
            .prune_dead_nodes(cutoff)
            .map_err(|e| TaskError::ExecutionFailed(e.to_string()))?;

        if pruned > 0 {
            info!("Pruned {} dead nodes", pruned);
        } else {
            info!("No dead nodes to prune");
        }

        Ok(Some(json!({ "pruned": pruned })))
    }
}
