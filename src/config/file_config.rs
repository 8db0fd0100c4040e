use crate::job_store::PeriodicTaskDefinition;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub node_id: Option<String>,
    pub metrics_port: Option<u16>,

    // Feature configs
    pub scheduler: Option<SchedulerConfig>,
    pub retry: Option<RetryConfig>,
    pub periodic_tasks: Vec<PeriodicTaskDefinition>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub periodic_interval_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    /// 0 disables the per-job timeout.
    pub job_timeout_ms: Option<u64>,
    pub default_max_retries: Option<u32>,
    /// Groups this node claims from. Empty means all groups.
    pub groups: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
