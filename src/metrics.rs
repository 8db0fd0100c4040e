use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all scheduler metrics
const PREFIX: &str = "docjobs";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Job lifecycle
    pub static ref JOBS_CLAIMED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_claimed_total"), "Jobs claimed by this node"),
        &["task"]
    ).expect("Failed to create jobs_claimed_total metric");

    pub static ref JOBS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_finished_total"), "Job executions finished by this node"),
        &["task", "state"]
    ).expect("Failed to create jobs_finished_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Handler execution time in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        &["task"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOBS_IN_FLIGHT: Gauge = Gauge::new(
        format!("{PREFIX}_jobs_in_flight"),
        "Jobs currently held by this node's worker pool"
    ).expect("Failed to create jobs_in_flight metric");

    // Recovery
    pub static ref ORPHANS_RECLAIMED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_orphans_reclaimed_total"),
        "Running jobs of dead nodes reclaimed by this node's sweep"
    ).expect("Failed to create orphans_reclaimed_total metric");

    pub static ref CLAIMS_LOST_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_claims_lost_total"),
        "Executions whose result was discarded because the claim went stale"
    ).expect("Failed to create claims_lost_total metric");

    // Periodic trigger
    pub static ref PERIODIC_TRIGGERS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_periodic_triggers_total"), "Periodic trigger attempts"),
        &["task_id", "outcome"]
    ).expect("Failed to create periodic_triggers_total metric");

    // Store
    pub static ref STORE_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_store_errors_total"), "Transient job store errors"),
        &["operation"]
    ).expect("Failed to create store_errors_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOBS_CLAIMED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_IN_FLIGHT.clone()));
    let _ = REGISTRY.register(Box::new(ORPHANS_RECLAIMED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CLAIMS_LOST_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PERIODIC_TRIGGERS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STORE_ERRORS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_job_claimed(task: &str) {
    JOBS_CLAIMED_TOTAL.with_label_values(&[task]).inc();
}

/// Record a finished execution. `state` is the job state the store reported.
pub fn record_job_finished(task: &str, state: &str, duration: Option<Duration>) {
    JOBS_FINISHED_TOTAL.with_label_values(&[task, state]).inc();
    if let Some(duration) = duration {
        JOB_DURATION_SECONDS
            .with_label_values(&[task])
            .observe(duration.as_secs_f64());
    }
}

pub fn set_jobs_in_flight(count: usize) {
    JOBS_IN_FLIGHT.set(count as f64);
}

pub fn record_orphans_reclaimed(count: usize) {
    ORPHANS_RECLAIMED_TOTAL.inc_by(count as u64);
}

pub fn record_claim_lost() {
    CLAIMS_LOST_TOTAL.inc();
}

pub fn record_periodic_trigger(task_id: &str, outcome: &str) {
    PERIODIC_TRIGGERS_TOTAL
        .with_label_values(&[task_id, outcome])
        .inc();
}

pub fn record_store_error(operation: &str) {
    STORE_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `GET /metrics` until the process exits.
pub async fn serve_metrics(port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Metrics server listening on port {}", port);
    axum::serve(listener, metrics_router()).await?;
    Ok(())
}
