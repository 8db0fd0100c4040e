use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use doc_job_scheduler::config;
use doc_job_scheduler::job_store::{JobStore, RetryPolicy, SqliteJobStore};
use doc_job_scheduler::metrics;
use doc_job_scheduler::scheduler::{create_scheduler, generate_node_id, TaskRegistry};
use doc_job_scheduler::tasks::NodeCleanupTask;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite job database shared by all nodes.
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Identifier of this node. Generated from the hostname when absent.
    #[clap(long)]
    pub node_id: Option<String>,

    /// Number of concurrent workers.
    #[clap(long)]
    pub workers: Option<usize>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9092)]
    pub metrics_port: u16,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_path: args.db_path.clone(),
            node_id: args.node_id.clone(),
            workers: args.workers,
            metrics_port: args.metrics_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    let node_id = app_config.node_id.clone().unwrap_or_else(generate_node_id);

    info!("Configuration loaded:");
    info!("  db_path: {:?}", app_config.db_path);
    info!("  node_id: {}", node_id);
    info!("  workers: {}", app_config.scheduler.workers);
    info!("  periodic tasks: {}", app_config.periodic_tasks.len());

    info!("Initializing metrics...");
    metrics::init_metrics();
    if app_config.metrics_port > 0 {
        let port = app_config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(port).await {
                error!("Metrics server failed: {:#}", e);
            }
        });
    }

    if !app_config.db_path.exists() {
        info!("Creating new job database at {:?}", app_config.db_path);
    }
    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::new(&app_config.db_path)?
            .with_retry_policy(RetryPolicy::new(&app_config.retry)),
    );

    // Register tasks
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(NodeCleanupTask::new(store.clone())))?;

    let shutdown_token = CancellationToken::new();
    let (scheduler, _scheduler_handle) = create_scheduler(
        store,
        registry,
        app_config.scheduler.clone(),
        node_id,
        &app_config.periodic_tasks,
        shutdown_token.clone(),
    )?;

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C, initiating graceful shutdown");
        signal_token.cancel();
    });

    let report = scheduler.run().await?;
    info!(
        "Scheduler drained: {} jobs completed, {} abandoned",
        report.completed,
        report.abandoned.len()
    );
    if !report.abandoned.is_empty() {
        warn!("Abandoned jobs: {:?}", report.abandoned);
        std::process::exit(1);
    }
    Ok(())
}
