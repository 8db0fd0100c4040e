//! Per-node coordinator: claims jobs into a bounded worker pool, keeps the
//! node and its claims alive, reclaims jobs of dead nodes and fires periodic
//! tasks.

use super::context::{CancelHandle, CancelReason, ProgressReporter, TaskContext};
use super::handle::SchedulerHandle;
use super::node::{local_hostname, NodeRegistration};
use super::periodic::PeriodicTrigger;
use super::registry::TaskRegistry;
use super::task::{ShutdownBehavior, TaskError, TaskHandler};
use crate::config::SchedulerSettings;
use crate::job_store::{
    now_millis, Claim, Job, JobOutcome, JobStore, JobStoreError, NodeInfo, PeriodicTaskDefinition,
};
use crate::metrics;
use anyhow::Context;
use chrono::Utc;
use rand::Rng;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// How a worker's execution ended, as seen by the coordinator.
#[derive(Debug)]
enum WorkerResult {
    Completed(Result<Option<JsonValue>, TaskError>),
    Panicked(String),
    TimedOut(Duration),
}

#[derive(Debug)]
struct WorkerReport {
    job_id: String,
    result: WorkerResult,
    elapsed: Duration,
}

/// Store write that closes an execution.
#[derive(Debug, Clone, PartialEq)]
enum FinishAction {
    Finish(JobOutcome),
    /// Hand the job back without consuming a retry.
    Release,
}

struct InFlightJob {
    claim: Claim,
    task_name: String,
    cancel: CancelHandle,
    shutdown_behavior: ShutdownBehavior,
    worker: Option<JoinHandle<()>>,
    started: Instant,
    /// Outcome the store has not accepted yet, retried on the next poll.
    pending: Option<FinishAction>,
}

/// What happened to the jobs in flight when the coordinator stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Executions that ended (finished or released) during the drain.
    pub completed: usize,
    /// Jobs still running at the drain deadline. They stay claimed and are
    /// reclaimed by other nodes once this node's heartbeat goes stale.
    pub abandoned: Vec<String>,
}

/// Manages claiming and executing jobs on this node.
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    settings: SchedulerSettings,
    node: NodeRegistration,
    periodic: PeriodicTrigger,

    /// Notified by [`SchedulerHandle`] on submission and cancel requests.
    wakeup: Arc<Notify>,

    /// Token to signal scheduler shutdown.
    shutdown_token: CancellationToken,

    /// Tasks this node can run. Jobs for other tasks are left to other nodes.
    task_names: Vec<String>,

    /// Executions owned by this node, keyed by job id.
    in_flight: HashMap<String, InFlightJob>,

    /// Timed-out handlers still running on a blocking thread. Each one keeps
    /// its worker slot until it returns.
    lingering: Arc<AtomicUsize>,

    report_tx: mpsc::UnboundedSender<WorkerReport>,
    report_rx: mpsc::UnboundedReceiver<WorkerReport>,
}

impl JobScheduler {
    pub fn node_id(&self) -> &str {
        self.node.node_id()
    }

    /// Run until the shutdown token fires, then drain.
    ///
    /// Fails only when the node cannot register at startup.
    pub async fn run(mut self) -> anyhow::Result<DrainReport> {
        info!(
            "Starting job scheduler on node {} with {} workers and {} registered tasks",
            self.node.node_id(),
            self.settings.workers,
            self.registry.len()
        );
        self.node
            .register()
            .context("Failed to register scheduler node")?;

        let mut heartbeat = interval(self.settings.heartbeat_interval);
        let mut sweep = interval(self.settings.sweep_interval);
        let mut periodic = interval(self.settings.periodic_interval);
        let shutdown = self.shutdown_token.clone();
        let wakeup = Arc::clone(&self.wakeup);
        let mut next_poll = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                Some(report) = self.report_rx.recv() => {
                    self.handle_report(report);
                    self.fill_slots();
                }
                _ = heartbeat.tick() => {
                    self.heartbeat();
                }
                _ = sweep.tick() => {
                    self.sweep();
                    self.fill_slots();
                }
                _ = periodic.tick() => {
                    self.trigger_periodic();
                    self.fill_slots();
                }
                _ = wakeup.notified() => {
                    self.poll();
                }
                _ = tokio::time::sleep_until(next_poll) => {
                    self.poll();
                    next_poll = Instant::now() + self.jittered_poll_interval();
                }
            }
        }

        let report = self.drain().await;
        info!("Job scheduler stopped");
        Ok(report)
    }

    /// Poll interval plus up to 10% jitter, so nodes started together drift apart.
    fn jittered_poll_interval(&self) -> Duration {
        let base = self.settings.poll_interval;
        let max_jitter = (base.as_millis() / 10) as u64;
        if max_jitter == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
    }

    fn poll(&mut self) {
        self.observe_cancel_requests();
        self.retry_pending_finishes();
        self.fill_slots();
    }

    fn observe_cancel_requests(&self) {
        if self.in_flight.is_empty() {
            return;
        }
        match self.store.cancel_requested_jobs(self.node.node_id()) {
            Ok(jobs) => {
                for (job_id, version) in jobs {
                    if let Some(entry) = self.in_flight.get(&job_id) {
                        if entry.claim.version == version && !entry.cancel.is_cancelled() {
                            info!("Cancelling job {} on request", job_id);
                            entry.cancel.cancel(CancelReason::Requested);
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Failed to check cancel requests: {}", e);
                metrics::record_store_error("cancel_requested_jobs");
            }
        }
    }

    /// Claim jobs until every worker slot is taken or nothing is eligible.
    fn fill_slots(&mut self) {
        while self.busy_slots() < self.settings.workers {
            let claimed = self.store.claim_next_matching(
                self.node.node_id(),
                self.settings.capable_groups(),
                Some(&self.task_names),
            );
            match claimed {
                Ok(Some(job)) => self.dispatch(job),
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to claim next job: {}", e);
                    metrics::record_store_error("claim_next");
                    break;
                }
            }
        }
        metrics::set_jobs_in_flight(self.in_flight.len());
    }

    fn busy_slots(&self) -> usize {
        self.in_flight.len() + self.lingering.load(Ordering::SeqCst)
    }

    fn dispatch(&mut self, job: Job) {
        let Some(claim) = job.claim() else {
            error!("Claimed job {} is not running, ignoring it", job.id);
            return;
        };
        metrics::record_job_claimed(&job.task_name);
        info!(
            "Claimed job {} (task: {}, group: {}, attempt: {}, version: {})",
            job.id,
            job.task_name,
            job.group_id,
            job.retry_count + 1,
            claim.version
        );

        let mut entry = InFlightJob {
            claim: claim.clone(),
            task_name: job.task_name.clone(),
            cancel: CancelHandle::new(),
            shutdown_behavior: ShutdownBehavior::Cancellable,
            worker: None,
            started: Instant::now(),
            pending: None,
        };

        let Some(handler) = self.registry.get(&job.task_name) else {
            warn!(
                "No handler registered for task {} (job {}), handing it back",
                job.task_name, job.id
            );
            self.complete(entry, FinishAction::Release);
            return;
        };
        if let Err(e) = handler.validate_args(&job.args) {
            warn!("Job {} has invalid arguments: {}", job.id, e);
            let outcome = JobOutcome::Failed {
                error: e.to_string(),
                retryable: false,
            };
            self.complete(entry, FinishAction::Finish(outcome));
            return;
        }

        entry.shutdown_behavior = handler.shutdown_behavior();
        entry.worker = Some(self.spawn_worker(handler, job, claim, entry.cancel.clone()));
        self.in_flight.insert(entry.claim.job_id.clone(), entry);
    }

    fn spawn_worker(
        &self,
        handler: Arc<dyn TaskHandler>,
        job: Job,
        claim: Claim,
        cancel: CancelHandle,
    ) -> JoinHandle<()> {
        let attempt = job.retry_count + 1;
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            task = %job.task_name,
            group = %job.group_id,
            node = %claim.node_id,
            attempt
        );
        let progress = ProgressReporter::new(Arc::clone(&self.store), claim.clone(), cancel.clone());
        let ctx = TaskContext::new(claim, attempt, cancel.clone(), progress, span.clone());
        let report_tx = self.report_tx.clone();
        let lingering = Arc::clone(&self.lingering);
        let wakeup = Arc::clone(&self.wakeup);
        let job_timeout = self.settings.job_timeout;
        let blocking_span = span.clone();
        let job_id = job.id;
        let args = job.args;

        // Spawn the handler in a blocking task since handlers are synchronous
        tokio::spawn(
            async move {
                let start_time = std::time::Instant::now();
                let mut execution = tokio::task::spawn_blocking(move || {
                    blocking_span.in_scope(|| handler.execute(&ctx, &args))
                });
                let mut timed_out = false;
                let result = match job_timeout {
                    Some(limit) => match tokio::time::timeout(limit, &mut execution).await {
                        Ok(joined) => worker_result(joined),
                        Err(_) => {
                            // Counted before the report so the slot never looks free
                            cancel.cancel(CancelReason::Timeout);
                            lingering.fetch_add(1, Ordering::SeqCst);
                            timed_out = true;
                            WorkerResult::TimedOut(limit)
                        }
                    },
                    None => worker_result((&mut execution).await),
                };
                let _ = report_tx.send(WorkerReport {
                    job_id: job_id.clone(),
                    result,
                    elapsed: start_time.elapsed(),
                });

                if timed_out {
                    let _ = execution.await;
                    lingering.fetch_sub(1, Ordering::SeqCst);
                    debug!(
                        "Timed-out handler of job {} returned after {:?}, freeing its slot",
                        job_id,
                        start_time.elapsed()
                    );
                    wakeup.notify_one();
                }
            }
            .instrument(span),
        )
    }

    fn handle_report(&mut self, report: WorkerReport) {
        let Some(mut entry) = self.in_flight.remove(&report.job_id) else {
            debug!("Ignoring report for job {} no longer in flight", report.job_id);
            return;
        };
        entry.worker = None;
        let job_id = &report.job_id;
        let elapsed = report.elapsed;

        match &report.result {
            WorkerResult::Completed(Ok(_)) => {
                info!("Job {} completed successfully in {:?}", job_id, elapsed)
            }
            WorkerResult::Completed(Err(TaskError::Cancelled)) => {
                info!(
                    "Job {} was cancelled after {:?} ({:?})",
                    job_id,
                    elapsed,
                    entry.cancel.reason()
                )
            }
            WorkerResult::Completed(Err(e)) => {
                warn!("Job {} failed after {:?}: {}", job_id, elapsed, e)
            }
            WorkerResult::Panicked(msg) => {
                error!("Job {} panicked after {:?}: {}", job_id, elapsed, msg)
            }
            WorkerResult::TimedOut(limit) => {
                warn!("Job {} exceeded its timeout of {:?}", job_id, limit)
            }
        }

        match finish_action(report.result, entry.cancel.reason()) {
            Some(action) => self.complete(entry, action),
            None => {
                warn!(
                    "Discarding result of job {}: its claim was taken over",
                    job_id
                );
                metrics::record_claim_lost();
                metrics::set_jobs_in_flight(self.in_flight.len());
            }
        }
    }

    /// Write the outcome of an execution. Transient store failures keep the
    /// entry in flight with the outcome pending; a stale claim drops it.
    fn complete(&mut self, mut entry: InFlightJob, action: FinishAction) {
        let claim = &entry.claim;
        let written = match &action {
            FinishAction::Finish(outcome) => self
                .store
                .finish(&claim.job_id, claim.version, outcome.clone())
                .map(|state| state.as_db_str()),
            FinishAction::Release => self
                .store
                .release(&claim.job_id, claim.version)
                .map(|_| "released"),
        };

        match written {
            Ok(state) => {
                debug!("Job {} is now {}", claim.job_id, state);
                metrics::record_job_finished(
                    &entry.task_name,
                    state,
                    Some(entry.started.elapsed()),
                );
            }
            Err(e @ (JobStoreError::StaleClaim { .. } | JobStoreError::NotFound(_))) => {
                warn!("Discarding result of job {}: {}", claim.job_id, e);
                metrics::record_claim_lost();
            }
            Err(e) => {
                error!(
                    "Failed to record outcome of job {}, will retry: {}",
                    claim.job_id, e
                );
                metrics::record_store_error("finish");
                entry.pending = Some(action);
                self.in_flight.insert(entry.claim.job_id.clone(), entry);
            }
        }
        metrics::set_jobs_in_flight(self.in_flight.len());
    }

    fn retry_pending_finishes(&mut self) {
        let pending: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.pending.is_some())
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in pending {
            let Some(mut entry) = self.in_flight.remove(&job_id) else {
                continue;
            };
            match entry.pending.take() {
                Some(action) => self.complete(entry, action),
                None => {
                    self.in_flight.insert(job_id, entry);
                }
            }
        }
    }

    /// Refresh this node's heartbeat and the heartbeat of every job it runs.
    fn heartbeat(&mut self) {
        if let Err(e) = self.node.heartbeat() {
            warn!(
                "Failed to refresh heartbeat of node {}: {}",
                self.node.node_id(),
                e
            );
            metrics::record_store_error("heartbeat_node");
        }

        self.reap_lost_workers();

        for (job_id, entry) in &self.in_flight {
            if entry.pending.is_some() || entry.cancel.reason() == Some(CancelReason::Fenced) {
                continue;
            }
            match self
                .store
                .heartbeat_progress(job_id, entry.claim.version, None)
            {
                Ok(ack) => {
                    if ack.cancel_requested && !entry.cancel.is_cancelled() {
                        info!("Cancelling job {} on request", job_id);
                        entry.cancel.cancel(CancelReason::Requested);
                    }
                }
                Err(e @ (JobStoreError::StaleClaim { .. } | JobStoreError::NotFound(_))) => {
                    warn!("Lost claim on job {}: {}", job_id, e);
                    entry.cancel.cancel(CancelReason::Fenced);
                }
                Err(e) => {
                    warn!("Failed to heartbeat job {}: {}", job_id, e);
                    metrics::record_store_error("heartbeat_progress");
                }
            }
        }
    }

    /// Fail executions whose worker exited without sending a report.
    ///
    /// Finished workers are collected before the queue is drained: a worker
    /// that finished has already sent its report, so only ids still in flight
    /// after the drain are truly lost.
    fn reap_lost_workers(&mut self) {
        let finished: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| {
                entry.pending.is_none()
                    && entry
                        .worker
                        .as_ref()
                        .is_some_and(|worker| worker.is_finished())
            })
            .map(|(job_id, _)| job_id.clone())
            .collect();

        while let Ok(report) = self.report_rx.try_recv() {
            self.handle_report(report);
        }

        for job_id in finished {
            let Some(entry) = self.in_flight.remove(&job_id) else {
                continue;
            };
            if entry.pending.is_some() {
                // Reported during the drain, its write is being retried
                self.in_flight.insert(job_id, entry);
                continue;
            }
            error!("Worker for job {} exited without reporting", job_id);
            let outcome = JobOutcome::Failed {
                error: "worker exited without reporting".to_string(),
                retryable: true,
            };
            self.complete(entry, FinishAction::Finish(outcome));
        }
    }

    /// Reclaim running jobs of nodes whose heartbeat went stale.
    fn sweep(&self) {
        let dead_before = now_millis() - self.settings.heartbeat_timeout.as_millis() as i64;
        match self.store.reclaim_orphans(dead_before) {
            Ok(0) => {}
            Ok(count) => {
                info!("Reclaimed {} orphaned jobs from dead nodes", count);
                metrics::record_orphans_reclaimed(count);
            }
            Err(e) => {
                warn!("Failed to reclaim orphaned jobs: {}", e);
                metrics::record_store_error("reclaim_orphans");
            }
        }
    }

    fn trigger_periodic(&mut self) {
        let summary = self.periodic.tick(Utc::now());
        if summary != Default::default() {
            debug!(
                "Periodic tick: {} enqueued, {} skipped, {} errors",
                summary.enqueued, summary.skipped, summary.errors
            );
        }
    }

    /// Stop claiming, cancel what can be cancelled and wait up to the drain
    /// timeout for the rest.
    async fn drain(&mut self) -> DrainReport {
        let in_flight_at_start = self.in_flight.len();
        if in_flight_at_start > 0 {
            info!(
                "Draining {} in-flight jobs (timeout {:?})",
                in_flight_at_start, self.settings.drain_timeout
            );
        }

        for (job_id, entry) in &self.in_flight {
            match entry.shutdown_behavior {
                ShutdownBehavior::Cancellable => {
                    debug!("Cancelling job {} for shutdown", job_id);
                    entry.cancel.cancel(CancelReason::Shutdown);
                }
                ShutdownBehavior::WaitForCompletion => {
                    info!("Waiting for job {} to complete...", job_id);
                }
            }
        }

        let deadline = Instant::now() + self.settings.drain_timeout;
        let mut heartbeat = interval(self.settings.heartbeat_interval);
        while !self.in_flight.is_empty() {
            tokio::select! {
                Some(report) = self.report_rx.recv() => {
                    self.handle_report(report);
                }
                _ = heartbeat.tick() => {
                    self.heartbeat();
                    self.retry_pending_finishes();
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let abandoned: Vec<String> = self.in_flight.keys().cloned().collect();
        for job_id in &abandoned {
            warn!(
                "Abandoning job {} at drain deadline, it will be reclaimed once this node is declared dead",
                job_id
            );
        }
        // Dropping the join handles detaches the remaining workers
        self.in_flight.clear();
        metrics::set_jobs_in_flight(0);

        if abandoned.is_empty() {
            if let Err(e) = self.node.deregister() {
                warn!("Failed to deregister node {}: {}", self.node.node_id(), e);
            }
        } else {
            warn!(
                "Leaving node {} registered with {} abandoned jobs",
                self.node.node_id(),
                abandoned.len()
            );
        }

        DrainReport {
            completed: in_flight_at_start.saturating_sub(abandoned.len()),
            abandoned,
        }
    }
}

fn interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn worker_result(joined: Result<Result<Option<JsonValue>, TaskError>, JoinError>) -> WorkerResult {
    match joined {
        Ok(result) => WorkerResult::Completed(result),
        Err(e) => WorkerResult::Panicked(format!("Task panic: {}", e)),
    }
}

/// Map an execution's end to the store write closing it. `None` means the
/// claim was lost and the result must be discarded.
fn finish_action(result: WorkerResult, cancel_reason: Option<CancelReason>) -> Option<FinishAction> {
    if cancel_reason == Some(CancelReason::Fenced) {
        return None;
    }
    let action = match result {
        WorkerResult::Completed(Ok(result)) => FinishAction::Finish(JobOutcome::Success { result }),
        WorkerResult::Completed(Err(TaskError::Cancelled)) => match cancel_reason {
            Some(CancelReason::Shutdown) => FinishAction::Release,
            Some(CancelReason::Timeout) => FinishAction::Finish(JobOutcome::Failed {
                error: "timed out".to_string(),
                retryable: false,
            }),
            _ => FinishAction::Finish(JobOutcome::Cancelled),
        },
        WorkerResult::Completed(Err(e)) => FinishAction::Finish(JobOutcome::Failed {
            error: e.to_string(),
            retryable: e.is_retryable(),
        }),
        WorkerResult::Panicked(msg) => FinishAction::Finish(JobOutcome::Failed {
            error: msg,
            retryable: true,
        }),
        WorkerResult::TimedOut(limit) => FinishAction::Finish(JobOutcome::Failed {
            error: format!("timed out after {:?}", limit),
            retryable: false,
        }),
    };
    Some(action)
}

/// Create a scheduler and its handle.
///
/// Installs `periodic_tasks` into the store; fails when the settings are
/// invalid or a periodic task is malformed or names an unregistered task.
pub fn create_scheduler(
    store: Arc<dyn JobStore>,
    registry: TaskRegistry,
    settings: SchedulerSettings,
    node_id: String,
    periodic_tasks: &[PeriodicTaskDefinition],
    shutdown_token: CancellationToken,
) -> anyhow::Result<(JobScheduler, SchedulerHandle)> {
    settings.validate()?;
    let task_names = registry.names().into_iter().map(String::from).collect();
    let registry = Arc::new(registry);

    let mut periodic = PeriodicTrigger::new(Arc::clone(&store));
    periodic.install(periodic_tasks, &registry)?;

    let node_info = NodeInfo::new(node_id, local_hostname(), settings.workers as u32);
    let node = NodeRegistration::new(Arc::clone(&store), node_info);
    let wakeup = Arc::new(Notify::new());
    let (report_tx, report_rx) = mpsc::unbounded_channel();

    let handle = SchedulerHandle::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&wakeup),
        settings.default_max_retries,
    );
    let scheduler = JobScheduler {
        store,
        registry,
        settings,
        node,
        periodic,
        wakeup,
        shutdown_token,
        task_names,
        in_flight: HashMap::new(),
        lingering: Arc::new(AtomicUsize::new(0)),
        report_tx,
        report_rx,
    };
    Ok((scheduler, handle))
}
