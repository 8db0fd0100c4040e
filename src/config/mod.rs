mod file_config;

pub use file_config::{FileConfig, RetryConfig, SchedulerConfig};

use crate::job_store::PeriodicTaskDefinition;
use crate::scheduler::CronSchedule;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub node_id: Option<String>,
    pub workers: Option<usize>,
    pub metrics_port: u16,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_path: PathBuf,
    /// Explicit node id; generated from the hostname when absent.
    pub node_id: Option<String>,
    /// 0 disables the metrics endpoint.
    pub metrics_port: u16,

    // Feature configs (with defaults)
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub periodic_tasks: Vec<PeriodicTaskDefinition>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        // The database file may not exist yet, its directory must
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let node_id = file.node_id.or_else(|| cli.node_id.clone());
        if node_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            bail!("node_id must not be empty");
        }
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        // Scheduler settings - merge file config with defaults
        let defaults = SchedulerSettings::default();
        let sched_file = file.scheduler.unwrap_or_default();
        let millis = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };
        let scheduler = SchedulerSettings {
            workers: sched_file
                .workers
                .or(cli.workers)
                .unwrap_or(defaults.workers),
            poll_interval: millis(sched_file.poll_interval_ms, defaults.poll_interval),
            heartbeat_interval: millis(
                sched_file.heartbeat_interval_ms,
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: millis(sched_file.heartbeat_timeout_ms, defaults.heartbeat_timeout),
            sweep_interval: millis(sched_file.sweep_interval_ms, defaults.sweep_interval),
            periodic_interval: millis(sched_file.periodic_interval_ms, defaults.periodic_interval),
            drain_timeout: millis(sched_file.drain_timeout_ms, defaults.drain_timeout),
            job_timeout: match sched_file.job_timeout_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.job_timeout,
            },
            default_max_retries: sched_file
                .default_max_retries
                .unwrap_or(defaults.default_max_retries),
            groups: sched_file.groups.unwrap_or_default(),
        };
        scheduler.validate()?;

        let retry_file = file.retry.unwrap_or_default();
        let retry_defaults = RetrySettings::default();
        let retry = RetrySettings {
            initial_backoff_ms: retry_file
                .initial_backoff_ms
                .unwrap_or(retry_defaults.initial_backoff_ms),
            max_backoff_ms: retry_file
                .max_backoff_ms
                .unwrap_or(retry_defaults.max_backoff_ms),
            backoff_multiplier: retry_file
                .backoff_multiplier
                .unwrap_or(retry_defaults.backoff_multiplier),
        };
        retry.validate()?;

        let periodic_tasks = file.periodic_tasks;
        validate_periodic_tasks(&periodic_tasks)?;

        Ok(Self {
            db_path,
            node_id,
            metrics_port,
            scheduler,
            retry,
            periodic_tasks,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Worker pool size, also reported as the node's capacity.
    pub workers: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// A node silent for this long is dead and its jobs are reclaimed.
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub periodic_interval: Duration,
    pub drain_timeout: Duration,
    /// Per-execution limit. On expiry the job is marked failed and its
    /// handler's token fires, but a synchronous handler cannot be stopped:
    /// its blocking thread runs until the handler returns, and keeps its
    /// worker slot until then. The job's group is freed at expiry, so another
    /// job of the same group may start while that thread is still running.
    pub job_timeout: Option<Duration>,
    pub default_max_retries: u32,
    /// Groups this node claims from. Empty means all groups.
    pub groups: Vec<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
            periodic_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            job_timeout: None,
            default_max_retries: 3,
            groups: Vec::new(),
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("scheduler.workers must be at least 1");
        }
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval),
            ("heartbeat_interval_ms", self.heartbeat_interval),
            ("sweep_interval_ms", self.sweep_interval),
            ("periodic_interval_ms", self.periodic_interval),
        ] {
            if value.is_zero() {
                bail!("scheduler.{} must be greater than 0", name);
            }
        }
        // A node must get several heartbeats in before anyone may declare it dead
        if self.heartbeat_interval * 3 > self.heartbeat_timeout {
            bail!(
                "scheduler.heartbeat_timeout_ms ({}) must be at least 3x heartbeat_interval_ms ({})",
                self.heartbeat_timeout.as_millis(),
                self.heartbeat_interval.as_millis()
            );
        }
        if self.groups.iter().any(|g| g.trim().is_empty()) {
            bail!("scheduler.groups must not contain empty group ids");
        }
        Ok(())
    }

    /// Groups filter for claims, `None` meaning all groups.
    pub fn capable_groups(&self) -> Option<&[String]> {
        if self.groups.is_empty() {
            None
        } else {
            Some(&self.groups)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 600_000, // 10 minutes
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            bail!("retry.backoff_multiplier must be a finite number >= 1.0");
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            bail!("retry.max_backoff_ms must not be smaller than retry.initial_backoff_ms");
        }
        Ok(())
    }
}

fn validate_periodic_tasks(definitions: &[PeriodicTaskDefinition]) -> Result<()> {
    let mut ids = HashSet::new();
    for def in definitions {
        if def.id.trim().is_empty() {
            bail!("periodic task id must not be empty");
        }
        if !ids.insert(def.id.as_str()) {
            bail!("Duplicate periodic task id: {}", def.id);
        }
        CronSchedule::parse(&def.schedule, &def.timezone)
            .with_context(|| format!("Invalid schedule for periodic task {}", def.id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn periodic(id: &str, schedule: &str) -> PeriodicTaskDefinition {
        PeriodicTaskDefinition {
            id: id.to_string(),
            schedule: schedule.to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
            task_name: "node_registry_cleanup".to_string(),
            group_id: "system".to_string(),
            args: json!({}),
            priority: 0,
            max_retries: 0,
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().join("jobs.db")),
            node_id: Some("worker-a".to_string()),
            workers: Some(2),
            metrics_port: 9092,
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_path, temp_dir.path().join("jobs.db"));
        assert_eq!(config.node_id.as_deref(), Some("worker-a"));
        assert_eq!(config.metrics_port, 9092);
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.heartbeat_timeout, Duration::from_secs(30));
        assert!(config.scheduler.job_timeout.is_none());
        assert!(config.scheduler.capable_groups().is_none());
        assert_eq!(config.retry, RetrySettings::default());
        assert!(config.periodic_tasks.is_empty());
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_path: Some(PathBuf::from("/should/be/overridden/jobs.db")),
            node_id: Some("cli-node".to_string()),
            workers: Some(2),
            metrics_port: 9092,
        };

        let file_config = FileConfig {
            db_path: Some(temp_dir.path().join("jobs.db").to_string_lossy().to_string()),
            node_id: Some("toml-node".to_string()),
            scheduler: Some(SchedulerConfig {
                workers: Some(6),
                job_timeout_ms: Some(60_000),
                groups: Some(vec!["tenant-a".to_string()]),
                ..Default::default()
            }),
            retry: Some(RetryConfig {
                initial_backoff_ms: Some(250),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_path, temp_dir.path().join("jobs.db"));
        assert_eq!(config.node_id.as_deref(), Some("toml-node"));
        assert_eq!(config.scheduler.workers, 6);
        assert_eq!(config.scheduler.job_timeout, Some(Duration::from_secs(60)));
        assert_eq!(
            config.scheduler.capable_groups(),
            Some(&["tenant-a".to_string()][..])
        );
        assert_eq!(config.retry.initial_backoff_ms, 250);
        assert_eq!(config.retry.max_backoff_ms, 600_000);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.metrics_port, 9092);
    }

    #[test]
    fn test_resolve_missing_db_path_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_path must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_path: Some(PathBuf::from("/nonexistent/path/that/should/not/exist/jobs.db")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_db_path_is_directory_error() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("is a directory"));
    }

    #[test]
    fn test_resolve_rejects_short_heartbeat_timeout() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().join("jobs.db")),
            ..Default::default()
        };
        let file_config = FileConfig {
            scheduler: Some(SchedulerConfig {
                heartbeat_interval_ms: Some(5_000),
                heartbeat_timeout_ms: Some(10_000),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, Some(file_config));
        assert!(result.unwrap_err().to_string().contains("at least 3x"));
    }

    #[test]
    fn test_resolve_rejects_zero_workers() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().join("jobs.db")),
            workers: Some(0),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("workers"));
    }

    #[test]
    fn test_resolve_rejects_bad_retry_settings() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().join("jobs.db")),
            ..Default::default()
        };
        let file_config = FileConfig {
            retry: Some(RetryConfig {
                backoff_multiplier: Some(0.5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, Some(file_config));
        assert!(result.unwrap_err().to_string().contains("backoff_multiplier"));
    }

    #[test]
    fn test_resolve_validates_periodic_tasks() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().join("jobs.db")),
            ..Default::default()
        };

        let valid = FileConfig {
            periodic_tasks: vec![periodic("a", "0 */10 * * * *"), periodic("b", "*/5 * * * *")],
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, Some(valid)).unwrap();
        assert_eq!(config.periodic_tasks.len(), 2);

        let duplicate = FileConfig {
            periodic_tasks: vec![periodic("a", "0 * * * * *"), periodic("a", "0 * * * * *")],
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, Some(duplicate));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Duplicate periodic task id"));

        let bad_cron = FileConfig {
            periodic_tasks: vec![periodic("a", "every tuesday")],
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, Some(bad_cron));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid schedule for periodic task a"));
    }
}
