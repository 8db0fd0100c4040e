//! Periodic trigger: turns due periodic task definitions into jobs.
//!
//! Every node ticks independently. The store makes one trigger per due
//! instant win (cursor check inside an immediate transaction) and rejects a
//! new instance while the previous one is unfinished.

use super::registry::TaskRegistry;
use crate::job_store::{JobStore, PeriodicTaskDefinition, TriggerOutcome};
use crate::metrics;
use anyhow::{bail, Context};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expr}': {message}")]
    InvalidExpression { expr: String, message: String },
    #[error("Invalid timezone '{0}': expected UTC or an offset like +02:00")]
    InvalidTimezone(String),
}

/// A parsed cron expression bound to a fixed UTC offset.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
    offset: FixedOffset,
}

impl CronSchedule {
    /// Parse a 5, 6 or 7 field cron expression. Five-field expressions get a
    /// `0` seconds field prepended.
    pub fn parse(expr: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let invalid = |message: String| ScheduleError::InvalidExpression {
            expr: expr.to_string(),
            message,
        };

        let normalized = match expr.split_whitespace().count() {
            5 => format!("0 {}", expr.trim()),
            6 | 7 => expr.trim().to_string(),
            n => return Err(invalid(format!("expected 5 to 7 fields, got {}", n))),
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        let offset = parse_timezone(timezone)?;

        Ok(Self { schedule, offset })
    }

    /// First instant strictly after `after`, evaluated in the schedule's offset.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.offset))
            .next()
            .map(|next| next.with_timezone(&Utc))
    }

    pub fn next_after_millis(&self, after_millis: i64) -> Option<i64> {
        let after = DateTime::<Utc>::from_timestamp_millis(after_millis)?;
        self.next_after(after).map(|next| next.timestamp_millis())
    }
}

/// `UTC`, `Z`, or a fixed offset such as `+02:00` or `-0530`.
fn parse_timezone(timezone: &str) -> Result<FixedOffset, ScheduleError> {
    let tz = timezone.trim();
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return Ok(Utc.fix());
    }
    tz.parse::<FixedOffset>()
        .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))
}

/// Counts of one trigger pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub enqueued: usize,
    /// Due instants skipped because the previous instance is unfinished.
    pub skipped: usize,
    pub errors: usize,
}

pub struct PeriodicTrigger {
    store: Arc<dyn JobStore>,
    schedules: HashMap<String, (String, String, CronSchedule)>,
}

impl PeriodicTrigger {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            schedules: HashMap::new(),
        }
    }

    /// Store the configured definitions. New tasks and tasks whose schedule
    /// changed get `next_due` computed from now; otherwise the stored cursor
    /// is kept.
    ///
    /// Fails when a definition names a task this node has no handler for.
    pub fn install(
        &mut self,
        definitions: &[PeriodicTaskDefinition],
        registry: &TaskRegistry,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        for def in definitions {
            if !registry.contains(&def.task_name) {
                bail!(
                    "Periodic task {} references unregistered task {}",
                    def.id,
                    def.task_name
                );
            }
            let schedule = CronSchedule::parse(&def.schedule, &def.timezone)
                .with_context(|| format!("Invalid schedule for periodic task {}", def.id))?;
            let next_due = schedule.next_after(now).map(|t| t.timestamp_millis());
            self.store
                .upsert_periodic_task(def, next_due)
                .with_context(|| format!("Failed to store periodic task {}", def.id))?;
            info!(
                "Installed periodic task {} ({} {}) -> {}",
                def.id, def.schedule, def.timezone, def.task_name
            );
            self.schedules.insert(
                def.id.clone(),
                (def.schedule.clone(), def.timezone.clone(), schedule),
            );
        }
        Ok(())
    }

    /// Cached schedule for a stored definition, reparsed when it changed
    /// (possibly by another node's configuration).
    fn schedule_for(&mut self, def: &PeriodicTaskDefinition) -> Option<&CronSchedule> {
        let stale = match self.schedules.get(&def.id) {
            Some((expr, tz, _)) => *expr != def.schedule || *tz != def.timezone,
            None => true,
        };
        if stale {
            match CronSchedule::parse(&def.schedule, &def.timezone) {
                Ok(schedule) => {
                    self.schedules.insert(
                        def.id.clone(),
                        (def.schedule.clone(), def.timezone.clone(), schedule),
                    );
                }
                Err(e) => {
                    warn!("Skipping periodic task {}: {}", def.id, e);
                    return None;
                }
            }
        }
        self.schedules.get(&def.id).map(|(_, _, schedule)| schedule)
    }

    /// Trigger every enabled task whose next due instant has passed.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();
        let now_millis = now.timestamp_millis();

        let tasks = match self.store.list_periodic_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Failed to load periodic tasks: {}", e);
                metrics::record_store_error("list_periodic_tasks");
                summary.errors += 1;
                return summary;
            }
        };

        for task in tasks {
            if !task.is_due(now_millis) {
                continue;
            }
            let Some(expected_due) = task.next_due else {
                continue;
            };
            let def = &task.definition;
            let Some(schedule) = self.schedule_for(def) else {
                summary.errors += 1;
                continue;
            };
            // Instants missed while no node was ticking are collapsed into this one
            let next_due = schedule.next_after(now).map(|t| t.timestamp_millis());

            match self
                .store
                .trigger_periodic(&def.id, expected_due, next_due, now_millis)
            {
                Ok(TriggerOutcome::Enqueued(job_id)) => {
                    info!(
                        "Periodic task {} enqueued job {} (task: {}, group: {})",
                        def.id, job_id, def.task_name, def.group_id
                    );
                    metrics::record_periodic_trigger(&def.id, "enqueued");
                    summary.enqueued += 1;
                }
                Ok(TriggerOutcome::Duplicate) => {
                    info!(
                        "Periodic task {} still has an unfinished job, skipping this run",
                        def.id
                    );
                    metrics::record_periodic_trigger(&def.id, "skipped");
                    summary.skipped += 1;
                }
                Ok(TriggerOutcome::NotDue) => {
                    debug!("Periodic task {} was handled by another node", def.id);
                }
                Err(e) => {
                    warn!("Failed to trigger periodic task {}: {}", def.id, e);
                    metrics::record_store_error("trigger_periodic");
                    summary.errors += 1;
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::{JobFilter, JobState, SqliteJobStore};
    use crate::scheduler::{TaskContext, TaskError, TaskHandler};
    use chrono::TimeZone;
    use serde_json::{json, Value as JsonValue};
    use tempfile::TempDir;

    struct NoopTask;

    impl TaskHandler for NoopTask {
        fn name(&self) -> &'static str {
            "reindex"
        }

        fn description(&self) -> &'static str {
            "no-op"
        }

        fn execute(
            &self,
            _ctx: &TaskContext,
            _args: &JsonValue,
        ) -> Result<Option<JsonValue>, TaskError> {
            Ok(None)
        }
    }

    fn definition(id: &str, schedule: &str) -> PeriodicTaskDefinition {
        PeriodicTaskDefinition {
            id: id.to_string(),
            schedule: schedule.to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
            task_name: "reindex".to_string(),
            group_id: "system".to_string(),
            args: json!({"full": false}),
            priority: 2,
            max_retries: 0,
        }
    }

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(NoopTask)).unwrap();
        registry
    }

    fn make_store() -> (Arc<dyn JobStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap();
        (Arc::new(store), temp_dir)
    }

    #[test]
    fn test_parse_five_and_six_field_expressions() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 30).unwrap();

        let five = CronSchedule::parse("*/15 * * * *", "UTC").unwrap();
        assert_eq!(
            five.next_after(at),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap())
        );

        let six = CronSchedule::parse("0 0 3 * * *", "UTC").unwrap();
        assert_eq!(
            six.next_after(at),
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 3, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_after_is_strictly_later() {
        let schedule = CronSchedule::parse("0 * * * * *", "UTC").unwrap();
        let on_the_minute = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(on_the_minute),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 1, 0).unwrap())
        );
        assert_eq!(
            schedule.next_after_millis(on_the_minute.timestamp_millis()),
            Some(on_the_minute.timestamp_millis() + 60_000)
        );
    }

    #[test]
    fn test_fixed_offset_timezone() {
        // 03:00 at +02:00 is 01:00 UTC
        let schedule = CronSchedule::parse("0 0 3 * * *", "+02:00").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(at),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap())
        );

        let schedule = CronSchedule::parse("0 0 3 * * *", "-0530").unwrap();
        assert_eq!(
            schedule.next_after(at),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_timezone_variants() {
        assert_eq!(parse_timezone("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone(" utc ").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone("+0130").unwrap().local_minus_utc(), 5400);
        assert_eq!(parse_timezone("-09:00").unwrap().local_minus_utc(), -32400);
        assert_eq!(parse_timezone("+23:59").unwrap().local_minus_utc(), 86_340);

        // Hours and minutes are both required
        for bad in ["Europe/Rome", "+01", "+1", "+25:00", "+01:75", "01:00", "+0:1:00", ""] {
            assert_eq!(
                parse_timezone(bad),
                Err(ScheduleError::InvalidTimezone(bad.to_string())),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_rejects_bad_expressions() {
        assert!(matches!(
            CronSchedule::parse("* * *", "UTC"),
            Err(ScheduleError::InvalidExpression { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 0 99 * * *", "UTC"),
            Err(ScheduleError::InvalidExpression { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 0 * * * *", "Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_install_requires_registered_task() {
        let (store, _temp_dir) = make_store();
        let mut trigger = PeriodicTrigger::new(store.clone());
        let mut def = definition("p", "0 * * * * *");
        def.task_name = "not_registered".to_string();

        let err = trigger.install(&[def], &registry()).unwrap_err();
        assert!(err.to_string().contains("unregistered task"));
        assert!(store.list_periodic_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_install_sets_future_next_due() {
        let (store, _temp_dir) = make_store();
        let mut trigger = PeriodicTrigger::new(store.clone());
        let before = Utc::now().timestamp_millis();

        trigger
            .install(&[definition("p", "0 * * * * *")], &registry())
            .unwrap();

        let tasks = store.list_periodic_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        let next_due = tasks[0].next_due.unwrap();
        assert!(next_due > before);
        assert!(next_due <= before + 60_000);
        assert!(tasks[0].last_triggered.is_none());
    }

    #[test]
    fn test_tick_enqueues_once_and_skips_while_unfinished() {
        let (store, _temp_dir) = make_store();
        let mut trigger = PeriodicTrigger::new(store.clone());
        trigger
            .install(&[definition("p", "0 * * * * *")], &registry())
            .unwrap();
        let due = store.list_periodic_tasks().unwrap()[0].next_due.unwrap();

        // Not due yet
        let before_due = DateTime::<Utc>::from_timestamp_millis(due - 1).unwrap();
        assert_eq!(trigger.tick(before_due), TickSummary::default());

        let at_due = DateTime::<Utc>::from_timestamp_millis(due).unwrap();
        let summary = trigger.tick(at_due);
        assert_eq!(summary.enqueued, 1);

        let jobs = store.list(&JobFilter::default()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].periodic_task_id.as_deref(), Some("p"));
        assert_eq!(jobs[0].priority, 2);
        assert_eq!(jobs[0].args, json!({"full": false}));
        assert_eq!(jobs[0].state, JobState::Waiting);

        // Ticking again at the same instant does nothing: the cursor moved
        assert_eq!(trigger.tick(at_due), TickSummary::default());

        // Next instant arrives while the first job is still waiting
        let task = &store.list_periodic_tasks().unwrap()[0];
        assert_eq!(task.next_due, Some(due + 60_000));
        assert_eq!(task.last_triggered, Some(due));
        let next = DateTime::<Utc>::from_timestamp_millis(due + 60_000).unwrap();
        let summary = trigger.tick(next);
        assert_eq!(summary.skipped, 1);
        assert_eq!(store.list(&JobFilter::default()).unwrap().len(), 1);
        assert_eq!(
            store.list_periodic_tasks().unwrap()[0].next_due,
            Some(due + 120_000)
        );
    }

    #[test]
    fn test_tick_collapses_missed_instants() {
        let (store, _temp_dir) = make_store();
        let mut trigger = PeriodicTrigger::new(store.clone());
        trigger
            .install(&[definition("p", "0 * * * * *")], &registry())
            .unwrap();
        let due = store.list_periodic_tasks().unwrap()[0].next_due.unwrap();

        // Ten minutes late: one job, cursor jumps past now
        let late = DateTime::<Utc>::from_timestamp_millis(due + 600_000 + 1).unwrap();
        assert_eq!(trigger.tick(late).enqueued, 1);
        assert_eq!(
            store.list_periodic_tasks().unwrap()[0].next_due,
            Some(due + 660_000)
        );
        assert_eq!(store.list(&JobFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_task_never_triggers() {
        let (store, _temp_dir) = make_store();
        let mut trigger = PeriodicTrigger::new(store.clone());
        let mut def = definition("p", "0 * * * * *");
        def.enabled = false;
        trigger.install(&[def], &registry()).unwrap();

        let far_future = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(trigger.tick(far_future), TickSummary::default());
        assert!(store.list(&JobFilter::default()).unwrap().is_empty());
    }
}
