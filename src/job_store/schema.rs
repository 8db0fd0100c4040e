//! Database schema for the shared job database.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, UniqueIndex, VersionedSchema,
};

// =============================================================================
// Version 1
// =============================================================================

/// Job queue. A claim is the (state='running', worker_node, version) triple of a row.
const JOBS_TABLE_V1: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("task_name", &SqlType::Text, non_null = true),
        sqlite_column!("args", &SqlType::Text, non_null = true),
        sqlite_column!("group_id", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("submitted_at", &SqlType::Integer, non_null = true),
        sqlite_column!("scheduled_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("finished_at", &SqlType::Integer),
        sqlite_column!("worker_node", &SqlType::Text),
        sqlite_column!("retry_count", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("max_retries", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("version", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("progress", &SqlType::Text),
        sqlite_column!("heartbeat_at", &SqlType::Integer),
        sqlite_column!("result", &SqlType::Text),
        sqlite_column!("error", &SqlType::Text),
        sqlite_column!("cancel_requested", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("periodic_task_id", &SqlType::Text),
    ],
    indices: &[
        ("idx_jobs_claim", "state, scheduled_at, priority"),
        ("idx_jobs_group_state", "group_id, state"),
        ("idx_jobs_worker", "worker_node, state"),
        ("idx_jobs_submitted", "submitted_at"),
    ],
    unique_indices: &[
        // At most one running job per group
        UniqueIndex {
            name: "uniq_jobs_running_group",
            columns: "group_id",
            predicate: Some("state = 'running'"),
        },
        // At most one unfinished instance per periodic task
        UniqueIndex {
            name: "uniq_jobs_active_periodic",
            columns: "periodic_task_id",
            predicate: Some(
                "periodic_task_id IS NOT NULL AND state IN ('waiting', 'scheduled', 'running')",
            ),
        },
    ],
};

/// Progress lines reported by handlers, one row per line.
const JOB_LOGS_TABLE_V1: Table = Table {
    name: "job_logs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "job_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "jobs",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("version", &SqlType::Integer, non_null = true),
        sqlite_column!("timestamp", &SqlType::Integer, non_null = true),
        sqlite_column!("message", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_job_logs_job", "job_id, id")],
    unique_indices: &[],
};

/// Round-robin cursor across groups.
const JOB_GROUPS_TABLE_V1: Table = Table {
    name: "job_groups",
    columns: &[
        sqlite_column!("group_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("last_claimed_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_indices: &[],
};

/// Live scheduler processes.
const NODES_TABLE_V1: Table = Table {
    name: "nodes",
    columns: &[
        sqlite_column!("node_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("hostname", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer, non_null = true),
        sqlite_column!("last_heartbeat", &SqlType::Integer, non_null = true),
        sqlite_column!("capacity", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_nodes_heartbeat", "last_heartbeat")],
    unique_indices: &[],
};

/// Periodic task definitions and their trigger cursor.
const PERIODIC_TASKS_TABLE_V1: Table = Table {
    name: "periodic_tasks",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("schedule", &SqlType::Text, non_null = true),
        sqlite_column!("timezone", &SqlType::Text, non_null = true),
        sqlite_column!("enabled", &SqlType::Integer, non_null = true, default_value = Some("1")),
        sqlite_column!("task_name", &SqlType::Text, non_null = true),
        sqlite_column!("group_id", &SqlType::Text, non_null = true),
        sqlite_column!("args", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("max_retries", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("last_triggered", &SqlType::Integer),
        sqlite_column!("next_due", &SqlType::Integer),
    ],
    indices: &[("idx_periodic_next_due", "enabled, next_due")],
    unique_indices: &[],
};

pub const JOB_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        JOBS_TABLE_V1,
        JOB_LOGS_TABLE_V1,
        JOB_GROUPS_TABLE_V1,
        NODES_TABLE_V1,
        PERIODIC_TASKS_TABLE_V1,
    ],
    migration: None,
}];
