//! Data models for the job store.
//!
//! Defines jobs, their lifecycle states, claims, nodes and periodic tasks.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Milliseconds since the Unix epoch, the time unit used throughout the store.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lifecycle state of a job.
///
/// Forward only, except for the requeue path `Running -> Waiting` taken on
/// retry or when the owning node is declared dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    /// Submitted with a start time in the future.
    Scheduled,
    Running,
    Success,   // terminal
    Failed,    // terminal
    Cancelled, // terminal
    /// Retries exhausted after the owning node died mid-run.
    Stuck, // terminal
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Waiting,
        JobState::Scheduled,
        JobState::Running,
        JobState::Success,
        JobState::Failed,
        JobState::Cancelled,
        JobState::Stuck,
    ];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Stuck => "stuck",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "scheduled" => Some(JobState::Scheduled),
            "running" => Some(JobState::Running),
            "success" => Some(JobState::Success),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            "stuck" => Some(JobState::Stuck),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Cancelled | JobState::Stuck
        )
    }

    /// Waiting for a worker (possibly not due yet).
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Scheduled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// A job row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub task_name: String,
    pub args: JsonValue,
    pub group_id: String,
    pub priority: i32,
    pub state: JobState,
    pub submitted_at: i64,
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub worker_node: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Fencing token, incremented on every state change.
    pub version: i64,
    /// Most recent progress line.
    pub progress: Option<String>,
    pub heartbeat_at: Option<i64>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub periodic_task_id: Option<String>,
}

impl Job {
    /// The claim held on this job, if it is running.
    pub fn claim(&self) -> Option<Claim> {
        if self.state != JobState::Running {
            return None;
        }
        Some(Claim {
            job_id: self.id.clone(),
            group_id: self.group_id.clone(),
            node_id: self.worker_node.clone()?,
            version: self.version,
        })
    }
}

/// Ownership of a running job by a node.
///
/// Every write a worker makes on behalf of the job must carry `version`; the
/// store rejects writes with an outdated version as stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub job_id: String,
    pub group_id: String,
    pub node_id: String,
    pub version: i64,
}

/// A job to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub task_name: String,
    pub group_id: String,
    pub priority: i32,
    pub args: JsonValue,
    /// Earliest start time (ms). `None` or a past instant means "now".
    pub schedule_at: Option<i64>,
    pub max_retries: u32,
    pub periodic_task_id: Option<String>,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>, group_id: impl Into<String>, args: JsonValue) -> Self {
        Self {
            task_name: task_name.into(),
            group_id: group_id.into(),
            priority: 0,
            args,
            schedule_at: None,
            max_retries: 0,
            periodic_task_id: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn schedule_at(mut self, at_millis: i64) -> Self {
        self.schedule_at = Some(at_millis);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn periodic_task_id(mut self, id: impl Into<String>) -> Self {
        self.periodic_task_id = Some(id.into());
        self
    }
}

/// How a worker's execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success { result: Option<JsonValue> },
    /// Retryable failures go back to `Waiting` while retries remain.
    Failed { error: String, retryable: bool },
    Cancelled,
}

/// Result of a progress heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressAck {
    pub cancel_requested: bool,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "state")]
pub enum CancelOutcome {
    /// The job was pending and is now `Cancelled`.
    Cancelled,
    /// The job is running; its handler will observe the flag.
    CancelRequested,
    AlreadyFinished(JobState),
}

/// Filter for listing jobs. Results are newest first.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub group_id: Option<String>,
    pub state: Option<JobState>,
    pub task_name: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            group_id: None,
            state: None,
            task_name: None,
            limit: 100,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobLogEntry {
    pub job_id: String,
    pub version: i64,
    pub timestamp: i64,
    pub message: String,
}

/// A scheduler process sharing the job database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub hostname: String,
    pub started_at: i64,
    pub last_heartbeat: i64,
    pub capacity: u32,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, hostname: impl Into<String>, capacity: u32) -> Self {
        let now = now_millis();
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            started_at: now,
            last_heartbeat: now,
            capacity,
        }
    }

    pub fn is_live(&self, now: i64, heartbeat_timeout_ms: i64) -> bool {
        now - self.last_heartbeat < heartbeat_timeout_ms
    }
}

/// Template and schedule of a recurring job.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PeriodicTaskDefinition {
    pub id: String,
    /// Cron expression, 5 to 7 fields.
    pub schedule: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "task")]
    pub task_name: String,
    #[serde(rename = "group")]
    pub group_id: String,
    #[serde(default)]
    pub args: JsonValue,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

/// A stored periodic task with its trigger cursor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodicTask {
    pub definition: PeriodicTaskDefinition,
    pub last_triggered: Option<i64>,
    /// `None` once the schedule has no further instants.
    pub next_due: Option<i64>,
}

impl PeriodicTask {
    pub fn is_due(&self, now: i64) -> bool {
        self.definition.enabled && self.next_due.is_some_and(|due| due <= now)
    }
}

/// Result of one trigger attempt for a periodic task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Enqueued(String),
    /// A previous instance is still unfinished; the due instant was skipped.
    Duplicate,
    /// Disabled, not due, or another node already handled this instant.
    NotDue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_db_roundtrip_and_terminal() {
        for state in JobState::ALL {
            assert_eq!(JobState::from_db_str(state.as_db_str()), Some(state));
        }
        assert!(JobState::from_db_str("bogus").is_none());

        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Scheduled.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Stuck.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_periodic_definition_defaults_from_toml() {
        let def: PeriodicTaskDefinition = toml::from_str(
            r#"
            id = "cleanup"
            schedule = "0 */5 * * * *"
            task = "node_registry_cleanup"
            group = "system"
            "#,
        )
        .unwrap();

        assert_eq!(def.timezone, "UTC");
        assert!(def.enabled);
        assert_eq!(def.priority, 0);
        assert_eq!(def.max_retries, 0);
        assert_eq!(def.args, JsonValue::Null);
    }

    #[test]
    fn test_node_liveness() {
        let mut node = NodeInfo::new("n1", "host", 2);
        node.last_heartbeat = 1_000;
        assert!(node.is_live(1_500, 1_000));
        assert!(!node.is_live(2_000, 1_000));
    }

    #[test]
    fn test_periodic_task_is_due() {
        let def: PeriodicTaskDefinition = toml::from_str(
            r#"
            id = "p"
            schedule = "* * * * *"
            task = "t"
            group = "g"
            enabled = false
            "#,
        )
        .unwrap();
        let mut task = PeriodicTask {
            definition: def,
            last_triggered: None,
            next_due: Some(100),
        };
        assert!(!task.is_due(200));
        task.definition.enabled = true;
        assert!(task.is_due(200));
        assert!(!task.is_due(50));
        task.next_due = None;
        assert!(!task.is_due(200));
    }
}
