//! SQLite-backed job store.
//!
//! Several processes open the same database file; each `SqliteJobStore` owns one
//! connection. Read-modify-write operations run in `BEGIN IMMEDIATE`
//! transactions and every state change is a conditional update on
//! `(id, state, version)`, so a writer holding an outdated version never wins.

use super::error::{is_unique_violation, JobStoreError, JobStoreResult};
use super::models::*;
use super::retry_policy::RetryPolicy;
use super::schema::JOB_STORE_VERSIONED_SCHEMAS;
use super::JobStore;
use crate::sqlite_persistence::read_schema_version;
use anyhow::{anyhow, bail, Context};
use rusqlite::{params, types::Type, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a connection waits on another process' write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Candidates fetched per claim attempt.
const CLAIM_CANDIDATES: usize = 16;

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    retry_policy: RetryPolicy,
}

struct ClaimCandidate {
    id: String,
    state: JobState,
    version: i64,
}

impl SqliteJobStore {
    /// Open the job database, creating the schema on first use.
    ///
    /// Safe to call concurrently from several processes on the same file:
    /// schema creation happens inside an immediate transaction.
    pub fn new<P: AsRef<Path>>(db_path: P) -> anyhow::Result<Self> {
        let mut conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open job database {:?}", db_path.as_ref()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        debug!("Job database journal mode: {}", journal_mode);
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        Self::init_schema(&mut conn)?;

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        JOB_STORE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
            retry_policy: RetryPolicy::immediate(),
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    fn init_schema(conn: &mut Connection) -> anyhow::Result<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match read_schema_version(&tx)? {
            None => {
                JOB_STORE_VERSIONED_SCHEMAS
                    .last()
                    .context("No schemas defined")?
                    .create(&tx)?;
                info!("Created job database schema");
            }
            Some(version) => {
                let schema_count = JOB_STORE_VERSIONED_SCHEMAS.len();
                if version >= schema_count {
                    bail!(
                        "Job database version {} is too new (max supported: {})",
                        version,
                        schema_count - 1
                    );
                }
                JOB_STORE_VERSIONED_SCHEMAS
                    .get(version)
                    .context("Failed to get schema")?
                    .validate(&tx)?;
                Self::migrate_if_needed(&tx, version)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> anyhow::Result<()> {
        let target_version = JOB_STORE_VERSIONED_SCHEMAS.len() - 1;
        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating job database from version {} to {}",
            current_version, target_version
        );
        for schema in JOB_STORE_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!("Running job database migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }
        conn.execute(
            &format!(
                "PRAGMA user_version = {}",
                crate::sqlite_persistence::BASE_DB_VERSION + target_version
            ),
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> JobStoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| JobStoreError::Other(anyhow!("job store connection mutex poisoned")))
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let state: String = row.get("state")?;
        let args: String = row.get("args")?;
        let result: Option<String> = row.get("result")?;
        Ok(Job {
            id: row.get("id")?,
            task_name: row.get("task_name")?,
            args: parse_json(&args)?,
            group_id: row.get("group_id")?,
            priority: row.get("priority")?,
            state: parse_state(&state)?,
            submitted_at: row.get("submitted_at")?,
            scheduled_at: row.get("scheduled_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            worker_node: row.get("worker_node")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            version: row.get("version")?,
            progress: row.get("progress")?,
            heartbeat_at: row.get("heartbeat_at")?,
            result: result.as_deref().map(parse_json).transpose()?,
            error: row.get("error")?,
            cancel_requested: row.get("cancel_requested")?,
            periodic_task_id: row.get("periodic_task_id")?,
        })
    }

    fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<NodeInfo> {
        Ok(NodeInfo {
            node_id: row.get("node_id")?,
            hostname: row.get("hostname")?,
            started_at: row.get("started_at")?,
            last_heartbeat: row.get("last_heartbeat")?,
            capacity: row.get("capacity")?,
        })
    }

    fn row_to_periodic_task(row: &rusqlite::Row) -> rusqlite::Result<PeriodicTask> {
        let args: String = row.get("args")?;
        Ok(PeriodicTask {
            definition: PeriodicTaskDefinition {
                id: row.get("id")?,
                schedule: row.get("schedule")?,
                timezone: row.get("timezone")?,
                enabled: row.get("enabled")?,
                task_name: row.get("task_name")?,
                group_id: row.get("group_id")?,
                args: parse_json(&args)?,
                priority: row.get("priority")?,
                max_retries: row.get("max_retries")?,
            },
            last_triggered: row.get("last_triggered")?,
            next_due: row.get("next_due")?,
        })
    }

    fn insert_job(conn: &Connection, job: &NewJob, now: i64) -> JobStoreResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let (state, scheduled_at) = match job.schedule_at {
            Some(at) if at > now => (JobState::Scheduled, at),
            _ => (JobState::Waiting, now),
        };
        let args = serde_json::to_string(&job.args)?;

        let inserted = conn.execute(
            r#"INSERT INTO jobs (
                id, task_name, args, group_id, priority, state,
                submitted_at, scheduled_at, retry_count, max_retries, version,
                cancel_requested, periodic_task_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, 0, 0, ?10)"#,
            params![
                id,
                job.task_name,
                args,
                job.group_id,
                job.priority,
                state.as_db_str(),
                now,
                scheduled_at,
                job.max_retries,
                job.periodic_task_id,
            ],
        );
        match inserted {
            Ok(_) => Ok(id),
            Err(e) if is_unique_violation(&e) => Err(JobStoreError::Duplicate(format!(
                "periodic task {} already has an unfinished job",
                job.periodic_task_id.as_deref().unwrap_or("-")
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Error to report when a fenced update matched no row.
    fn stale_or_missing(conn: &Connection, job_id: &str, version: i64) -> JobStoreError {
        let exists = conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [job_id], |_| Ok(()))
            .optional();
        match exists {
            Ok(Some(())) => JobStoreError::StaleClaim {
                job_id: job_id.to_string(),
                version,
            },
            Ok(None) => JobStoreError::NotFound(job_id.to_string()),
            Err(e) => e.into(),
        }
    }

    fn claim_candidates(
        conn: &Connection,
        now: i64,
        capable_groups: Option<&[String]>,
        task_names: Option<&[String]>,
    ) -> JobStoreResult<Vec<ClaimCandidate>> {
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];
        let mut filter_clause = String::new();
        for (column, values) in [("j.group_id", capable_groups), ("j.task_name", task_names)] {
            let Some(values) = values else {
                continue;
            };
            let placeholders: Vec<String> = values
                .iter()
                .map(|value| {
                    params.push(Box::new(value.clone()));
                    format!("?{}", params.len())
                })
                .collect();
            filter_clause.push_str(&format!(
                " AND {} IN ({})",
                column,
                placeholders.join(", ")
            ));
        }

        let sql = format!(
            r#"SELECT j.id, j.state, j.version FROM jobs j
               LEFT JOIN job_groups g ON g.group_id = j.group_id
               WHERE j.state IN ('waiting', 'scheduled')
                 AND j.scheduled_at <= ?1
                 AND j.cancel_requested = 0
                 AND NOT EXISTS (
                     SELECT 1 FROM jobs r WHERE r.group_id = j.group_id AND r.state = 'running'
                 )
                 {}
               ORDER BY j.priority DESC, COALESCE(g.last_claimed_at, 0) ASC,
                        j.submitted_at ASC, j.id ASC
               LIMIT {}"#,
            filter_clause, CLAIM_CANDIDATES
        );

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let candidates = stmt
            .query_map(params_refs.as_slice(), |row| {
                let state: String = row.get(1)?;
                Ok(ClaimCandidate {
                    id: row.get(0)?,
                    state: parse_state(&state)?,
                    version: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candidates)
    }

    fn try_claim_locked(
        conn: &mut Connection,
        job_id: &str,
        seen_state: JobState,
        seen_version: i64,
        node_id: &str,
        now: i64,
    ) -> JobStoreResult<bool> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            r#"UPDATE jobs
               SET state = 'running', worker_node = ?1, started_at = ?2, heartbeat_at = ?2,
                   progress = NULL, version = version + 1
               WHERE id = ?3 AND state = ?4 AND version = ?5
                 AND cancel_requested = 0 AND scheduled_at <= ?2
                 AND NOT EXISTS (
                     SELECT 1 FROM jobs r WHERE r.group_id = jobs.group_id AND r.state = 'running'
                 )"#,
            params![node_id, now, job_id, seen_state.as_db_str(), seen_version],
        );
        let updated = match updated {
            Ok(count) => count,
            Err(e) if is_unique_violation(&e) => 0,
            Err(e) => return Err(e.into()),
        };
        if updated == 0 {
            return Ok(false);
        }

        tx.execute(
            r#"INSERT INTO job_groups (group_id, last_claimed_at)
               SELECT group_id, ?2 FROM jobs WHERE id = ?1
               ON CONFLICT(group_id) DO UPDATE SET last_claimed_at = excluded.last_claimed_at"#,
            params![job_id, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Conditionally move one job from `seen_state`/`seen_version` to `Running`.
    ///
    /// This is the single step of the claim protocol: it returns false when
    /// another node changed the row since it was read, or when the group
    /// already has a running job.
    pub fn try_claim(
        &self,
        job_id: &str,
        seen_state: JobState,
        seen_version: i64,
        node_id: &str,
    ) -> JobStoreResult<bool> {
        let mut conn = self.lock()?;
        Self::try_claim_locked(
            &mut conn,
            job_id,
            seen_state,
            seen_version,
            node_id,
            now_millis(),
        )
    }
}

impl JobStore for SqliteJobStore {
    // === Jobs ===

    fn insert(&self, job: NewJob) -> JobStoreResult<String> {
        let conn = self.lock()?;
        let id = Self::insert_job(&conn, &job, now_millis())?;
        debug!(
            "Inserted job {} (task: {}, group: {}, priority: {})",
            id, job.task_name, job.group_id, job.priority
        );
        Ok(id)
    }

    fn get(&self, job_id: &str) -> JobStoreResult<Option<Job>> {
        let conn = self.lock()?;
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", [job_id], Self::row_to_job)
            .optional()?;
        Ok(job)
    }

    fn list(&self, filter: &JobFilter) -> JobStoreResult<Vec<Job>> {
        let conn = self.lock()?;

        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(group_id) = &filter.group_id {
            params.push(Box::new(group_id.clone()));
            clauses.push(format!("group_id = ?{}", params.len()));
        }
        if let Some(state) = filter.state {
            params.push(Box::new(state.as_db_str()));
            clauses.push(format!("state = ?{}", params.len()));
        }
        if let Some(task_name) = &filter.task_name {
            params.push(Box::new(task_name.clone()));
            clauses.push(format!("task_name = ?{}", params.len()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        params.push(Box::new(filter.limit as i64));
        let limit_index = params.len();
        params.push(Box::new(filter.offset as i64));
        let offset_index = params.len();

        let sql = format!(
            "SELECT * FROM jobs {} ORDER BY submitted_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
            where_sql, limit_index, offset_index
        );
        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let jobs = stmt
            .query_map(params_refs.as_slice(), Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn count_by_state(&self) -> JobStoreResult<Vec<(JobState, usize)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let counts = stmt
            .query_map([], |row| {
                let state: String = row.get(0)?;
                Ok((parse_state(&state)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    fn job_logs(&self, job_id: &str, limit: usize) -> JobStoreResult<Vec<JobLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT job_id, version, timestamp, message FROM job_logs
               WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2"#,
        )?;
        let mut entries = stmt
            .query_map(params![job_id, limit as i64], |row| {
                Ok(JobLogEntry {
                    job_id: row.get(0)?,
                    version: row.get(1)?,
                    timestamp: row.get(2)?,
                    message: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        entries.reverse();
        Ok(entries)
    }

    // === Claim protocol ===

    fn claim_next_matching(
        &self,
        node_id: &str,
        capable_groups: Option<&[String]>,
        task_names: Option<&[String]>,
    ) -> JobStoreResult<Option<Job>> {
        let nothing_matches = |filter: Option<&[String]>| filter.is_some_and(|f| f.is_empty());
        if nothing_matches(capable_groups) || nothing_matches(task_names) {
            return Ok(None);
        }

        let mut conn = self.lock()?;
        let now = now_millis();
        let candidates = Self::claim_candidates(&conn, now, capable_groups, task_names)?;

        for candidate in candidates {
            let claimed = Self::try_claim_locked(
                &mut conn,
                &candidate.id,
                candidate.state,
                candidate.version,
                node_id,
                now,
            )?;
            if claimed {
                let job = conn.query_row(
                    "SELECT * FROM jobs WHERE id = ?1",
                    [&candidate.id],
                    Self::row_to_job,
                )?;
                return Ok(Some(job));
            }
            debug!(
                "Claim on job {} (version {}) lost, trying next candidate",
                candidate.id, candidate.version
            );
        }
        Ok(None)
    }

    fn heartbeat_progress(
        &self,
        job_id: &str,
        version: i64,
        line: Option<&str>,
    ) -> JobStoreResult<ProgressAck> {
        let mut conn = self.lock()?;
        let now = now_millis();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            r#"UPDATE jobs SET heartbeat_at = ?1, progress = COALESCE(?2, progress)
               WHERE id = ?3 AND version = ?4 AND state = 'running'"#,
            params![now, line, job_id, version],
        )?;
        if updated == 0 {
            return Err(Self::stale_or_missing(&tx, job_id, version));
        }

        if let Some(line) = line {
            tx.execute(
                "INSERT INTO job_logs (job_id, version, timestamp, message) VALUES (?1, ?2, ?3, ?4)",
                params![job_id, version, now, line],
            )?;
        }

        let cancel_requested: bool = tx.query_row(
            "SELECT cancel_requested FROM jobs WHERE id = ?1",
            [job_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(ProgressAck { cancel_requested })
    }

    fn finish(&self, job_id: &str, version: i64, outcome: JobOutcome) -> JobStoreResult<JobState> {
        let mut conn = self.lock()?;
        let now = now_millis();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                r#"SELECT state, version, retry_count, max_retries, cancel_requested
                   FROM jobs WHERE id = ?1"#,
                [job_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((state, current_version, retry_count, max_retries, cancel_requested)) = row else {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        };
        if state != JobState::Running.as_db_str() || current_version != version {
            return Err(JobStoreError::StaleClaim {
                job_id: job_id.to_string(),
                version,
            });
        }

        let (new_state, updated) = match outcome {
            JobOutcome::Success { result } => {
                let result = result.map(|v| serde_json::to_string(&v)).transpose()?;
                let updated = tx.execute(
                    r#"UPDATE jobs SET state = 'success', finished_at = ?1, result = ?2,
                           error = NULL, version = version + 1
                       WHERE id = ?3 AND version = ?4"#,
                    params![now, result, job_id, version],
                )?;
                (JobState::Success, updated)
            }
            JobOutcome::Failed { error, .. } if cancel_requested => {
                let updated = tx.execute(
                    r#"UPDATE jobs SET state = 'cancelled', finished_at = ?1, error = ?2,
                           version = version + 1
                       WHERE id = ?3 AND version = ?4"#,
                    params![now, error, job_id, version],
                )?;
                (JobState::Cancelled, updated)
            }
            JobOutcome::Failed { error, retryable } if retryable && retry_count < max_retries => {
                let next_attempt = self.retry_policy.next_attempt_at(now, retry_count);
                let updated = tx.execute(
                    r#"UPDATE jobs SET state = 'waiting', retry_count = retry_count + 1,
                           scheduled_at = ?1, worker_node = NULL, error = ?2,
                           version = version + 1
                       WHERE id = ?3 AND version = ?4"#,
                    params![next_attempt, error, job_id, version],
                )?;
                debug!(
                    "Job {} requeued for retry {}/{} at {}",
                    job_id,
                    retry_count + 1,
                    max_retries,
                    next_attempt
                );
                (JobState::Waiting, updated)
            }
            JobOutcome::Failed { error, .. } => {
                let updated = tx.execute(
                    r#"UPDATE jobs SET state = 'failed', finished_at = ?1, error = ?2,
                           version = version + 1
                       WHERE id = ?3 AND version = ?4"#,
                    params![now, error, job_id, version],
                )?;
                (JobState::Failed, updated)
            }
            JobOutcome::Cancelled => {
                let updated = tx.execute(
                    r#"UPDATE jobs SET state = 'cancelled', finished_at = ?1,
                           error = COALESCE(error, 'cancelled'), version = version + 1
                       WHERE id = ?2 AND version = ?3"#,
                    params![now, job_id, version],
                )?;
                (JobState::Cancelled, updated)
            }
        };
        if updated == 0 {
            return Err(Self::stale_or_missing(&tx, job_id, version));
        }
        tx.commit()?;
        Ok(new_state)
    }

    fn release(&self, job_id: &str, version: i64) -> JobStoreResult<()> {
        let conn = self.lock()?;
        let now = now_millis();
        // A job flagged for cancellation must not go back to the queue, where
        // the claim filter would skip it forever.
        let updated = conn.execute(
            r#"UPDATE jobs SET
                   state = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'waiting' END,
                   finished_at = CASE WHEN cancel_requested = 1 THEN ?1 ELSE NULL END,
                   worker_node = NULL, version = version + 1
               WHERE id = ?2 AND version = ?3 AND state = 'running'"#,
            params![now, job_id, version],
        )?;
        if updated == 0 {
            return Err(Self::stale_or_missing(&conn, job_id, version));
        }
        Ok(())
    }

    fn request_cancel(&self, job_id: &str) -> JobStoreResult<CancelOutcome> {
        let mut conn = self.lock()?;
        let now = now_millis();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                "SELECT state, version FROM jobs WHERE id = ?1",
                [job_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        let Some((state, version)) = row else {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        };
        let state = JobState::from_db_str(&state)
            .ok_or_else(|| anyhow!("Unknown job state '{}' for job {}", state, job_id))?;

        let outcome = if state.is_pending() {
            let updated = tx.execute(
                r#"UPDATE jobs SET state = 'cancelled', cancel_requested = 1, finished_at = ?1,
                       error = 'cancelled', version = version + 1
                   WHERE id = ?2 AND version = ?3"#,
                params![now, job_id, version],
            )?;
            if updated == 0 {
                return Err(Self::stale_or_missing(&tx, job_id, version));
            }
            CancelOutcome::Cancelled
        } else if state == JobState::Running {
            tx.execute(
                "UPDATE jobs SET cancel_requested = 1 WHERE id = ?1",
                [job_id],
            )?;
            CancelOutcome::CancelRequested
        } else {
            CancelOutcome::AlreadyFinished(state)
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn cancel_requested_jobs(&self, node_id: &str) -> JobStoreResult<Vec<(String, i64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, version FROM jobs
               WHERE worker_node = ?1 AND state = 'running' AND cancel_requested = 1"#,
        )?;
        let jobs = stmt
            .query_map([node_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn reclaim_orphans(&self, dead_before: i64) -> JobStoreResult<usize> {
        let mut conn = self.lock()?;
        let now = now_millis();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Jobs whose node row is gone fall back on their own heartbeat.
        let orphans = {
            let mut stmt = tx.prepare(
                r#"SELECT j.id, j.version, j.retry_count, j.max_retries, j.cancel_requested,
                          j.worker_node
                   FROM jobs j
                   LEFT JOIN nodes n ON n.node_id = j.worker_node
                   WHERE j.state = 'running'
                     AND ((n.node_id IS NOT NULL AND n.last_heartbeat < ?1)
                       OR (n.node_id IS NULL
                           AND COALESCE(j.heartbeat_at, j.started_at, 0) < ?1))"#,
            )?;
            let rows = stmt
                .query_map([dead_before], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut reclaimed = 0;
        for (job_id, version, retry_count, max_retries, cancel_requested, node) in orphans {
            let node = node.unwrap_or_else(|| "-".to_string());
            let error = format!("worker node {} stopped heartbeating", node);
            let (new_state, updated) = if cancel_requested {
                let updated = tx.execute(
                    r#"UPDATE jobs SET state = 'cancelled', finished_at = ?1, error = ?2,
                           version = version + 1
                       WHERE id = ?3 AND version = ?4 AND state = 'running'"#,
                    params![now, error, job_id, version],
                )?;
                (JobState::Cancelled, updated)
            } else if retry_count < max_retries {
                let updated = tx.execute(
                    r#"UPDATE jobs SET state = 'waiting', retry_count = retry_count + 1,
                           scheduled_at = ?1, worker_node = NULL, error = ?2,
                           version = version + 1
                       WHERE id = ?3 AND version = ?4 AND state = 'running'"#,
                    params![now, error, job_id, version],
                )?;
                (JobState::Waiting, updated)
            } else {
                let updated = tx.execute(
                    r#"UPDATE jobs SET state = 'stuck', finished_at = ?1, error = ?2,
                           version = version + 1
                       WHERE id = ?3 AND version = ?4 AND state = 'running'"#,
                    params![now, error, job_id, version],
                )?;
                (JobState::Stuck, updated)
            };
            if updated > 0 {
                warn!(
                    "Reclaimed orphaned job {} from node {} -> {}",
                    job_id, node, new_state
                );
                reclaimed += updated;
            }
        }
        tx.commit()?;
        Ok(reclaimed)
    }

    // === Nodes ===

    fn register_node(&self, node: &NodeInfo) -> JobStoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"INSERT INTO nodes (node_id, hostname, started_at, last_heartbeat, capacity)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(node_id) DO UPDATE SET
                   hostname = excluded.hostname,
                   started_at = excluded.started_at,
                   last_heartbeat = excluded.last_heartbeat,
                   capacity = excluded.capacity"#,
            params![
                node.node_id,
                node.hostname,
                node.started_at,
                node.last_heartbeat,
                node.capacity
            ],
        )?;
        Ok(())
    }

    fn heartbeat_node(&self, node_id: &str) -> JobStoreResult<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE nodes SET last_heartbeat = ?1 WHERE node_id = ?2",
            params![now_millis(), node_id],
        )?;
        Ok(updated > 0)
    }

    fn deregister_node(&self, node_id: &str) -> JobStoreResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM nodes WHERE node_id = ?1", [node_id])?;
        Ok(())
    }

    fn list_nodes(&self) -> JobStoreResult<Vec<NodeInfo>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM nodes ORDER BY node_id")?;
        let nodes = stmt
            .query_map([], Self::row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    fn prune_dead_nodes(&self, dead_before: i64) -> JobStoreResult<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            r#"DELETE FROM nodes
               WHERE last_heartbeat < ?1
                 AND NOT EXISTS (
                     SELECT 1 FROM jobs
                     WHERE jobs.worker_node = nodes.node_id AND jobs.state = 'running'
                 )"#,
            [dead_before],
        )?;
        Ok(deleted)
    }

    // === Periodic tasks ===

    fn upsert_periodic_task(
        &self,
        definition: &PeriodicTaskDefinition,
        next_due: Option<i64>,
    ) -> JobStoreResult<()> {
        let conn = self.lock()?;
        let args = serde_json::to_string(&definition.args)?;
        // SET expressions see the old row, so the CASE compares old and new schedule.
        conn.execute(
            r#"INSERT INTO periodic_tasks (
                   id, schedule, timezone, enabled, task_name, group_id, args,
                   priority, max_retries, last_triggered, next_due
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10)
               ON CONFLICT(id) DO UPDATE SET
                   next_due = CASE
                       WHEN periodic_tasks.schedule != excluded.schedule
                         OR periodic_tasks.timezone != excluded.timezone
                         OR periodic_tasks.next_due IS NULL
                       THEN excluded.next_due
                       ELSE periodic_tasks.next_due
                   END,
                   schedule = excluded.schedule,
                   timezone = excluded.timezone,
                   enabled = excluded.enabled,
                   task_name = excluded.task_name,
                   group_id = excluded.group_id,
                   args = excluded.args,
                   priority = excluded.priority,
                   max_retries = excluded.max_retries"#,
            params![
                definition.id,
                definition.schedule,
                definition.timezone,
                definition.enabled,
                definition.task_name,
                definition.group_id,
                args,
                definition.priority,
                definition.max_retries,
                next_due,
            ],
        )?;
        Ok(())
    }

    fn list_periodic_tasks(&self) -> JobStoreResult<Vec<PeriodicTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM periodic_tasks ORDER BY id")?;
        let tasks = stmt
            .query_map([], Self::row_to_periodic_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn trigger_periodic(
        &self,
        task_id: &str,
        expected_due: i64,
        next_due: Option<i64>,
        now: i64,
    ) -> JobStoreResult<TriggerOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let task = tx
            .query_row(
                "SELECT * FROM periodic_tasks WHERE id = ?1",
                [task_id],
                Self::row_to_periodic_task,
            )
            .optional()?
            .ok_or_else(|| JobStoreError::NotFound(task_id.to_string()))?;

        if !task.definition.enabled || task.next_due != Some(expected_due) || expected_due > now {
            return Ok(TriggerOutcome::NotDue);
        }

        let definition = &task.definition;
        let new_job = NewJob::new(
            definition.task_name.clone(),
            definition.group_id.clone(),
            definition.args.clone(),
        )
        .priority(definition.priority)
        .max_retries(definition.max_retries)
        .periodic_task_id(definition.id.clone());

        let outcome = match Self::insert_job(&tx, &new_job, now) {
            Ok(job_id) => TriggerOutcome::Enqueued(job_id),
            Err(JobStoreError::Duplicate(_)) => TriggerOutcome::Duplicate,
            Err(e) => return Err(e),
        };

        tx.execute(
            r#"UPDATE periodic_tasks SET last_triggered = ?1, next_due = ?2
               WHERE id = ?3 AND next_due = ?4"#,
            params![now, next_due, task_id, expected_due],
        )?;
        tx.commit()?;
        Ok(outcome)
    }
}

fn parse_state(s: &str) -> rusqlite::Result<JobState> {
    JobState::from_db_str(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            format!("unknown job state '{}'", s).into(),
        )
    })
}

fn parse_json(s: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}
