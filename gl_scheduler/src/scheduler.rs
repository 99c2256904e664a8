//! ABOUTME: The coordination core: poll loop, lease lock protocol, execution worker
//! ABOUTME: Stale-lock and stuck-job sweeps, orphan recovery, and the live job-control API

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::FutureExt;
use gl_core::{Error, Id, Result};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bucket_map::BucketMap;
use crate::collaborators::{Crawler, CrawlerFactory, ExecutionStore, JobStore, LivePublisher, LogArchiver};
use crate::job_logger::{JobLogger, Verbosity};
use crate::log_capture::LogCaptureService;
use crate::metrics::MetricsAggregator;
use crate::settings::SchedulerSettings;
use crate::state_machine::{self, JobStatus};
use crate::types::{ExecutionStatus, Job, JobExecution, JobSummary};

const MAX_BACKOFF_SECONDS: i64 = 3_600;

struct ActiveExecution {
    cancellation: CancellationToken,
    logger: JobLogger,
}

/// Coordinates recurring crawl jobs across replicas: claims jobs via a
/// lease lock, runs them with panic-safe supervision, records executions,
/// and reschedules according to each job's policy (§3, §4.8).
pub struct IntervalSchedulerCore {
    instance_id: String,
    settings: SchedulerSettings,
    job_store: Arc<dyn JobStore>,
    execution_store: Arc<dyn ExecutionStore>,
    crawler_factory: Arc<dyn CrawlerFactory>,
    log_capture: Arc<LogCaptureService>,
    live_publisher: Arc<dyn LivePublisher>,
    bucket_map: Arc<BucketMap>,
    active: RwLock<HashMap<String, ActiveExecution>>,
    shutdown: CancellationToken,
}

impl IntervalSchedulerCore {
    pub fn new(
        settings: SchedulerSettings,
        job_store: Arc<dyn JobStore>,
        execution_store: Arc<dyn ExecutionStore>,
        crawler_factory: Arc<dyn CrawlerFactory>,
        log_archiver: Arc<dyn LogArchiver>,
        live_publisher: Arc<dyn LivePublisher>,
    ) -> Self {
        let log_capture = Arc::new(LogCaptureService::new(
            log_archiver,
            live_publisher.clone(),
            settings.log_buffer_capacity,
        ));

        Self {
            instance_id: instance_id(),
            settings,
            job_store,
            execution_store,
            crawler_factory,
            log_capture,
            live_publisher,
            bucket_map: Arc::new(BucketMap::new()),
            active: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Runs startup orphan recovery, then spawns the poll loop, both sweep
    /// loops, and the metrics rollup loop. Returns once all are spawned; they
    /// keep running until [`Self::stop`] is called.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(instance = %self.instance_id, "starting scheduler core");
        self.recover_orphans().await?;

        let poll_core = self.clone();
        tokio::spawn(async move { poll_core.run_poll_loop().await });

        let stale_lock_core = self.clone();
        tokio::spawn(async move { stale_lock_core.run_stale_lock_sweep().await });

        let stuck_job_core = self.clone();
        tokio::spawn(async move { stuck_job_core.run_stuck_job_sweep().await });

        let metrics_core = self.clone();
        tokio::spawn(async move { metrics_core.run_metrics_rollup_loop().await });

        Ok(())
    }

    /// Signals every loop and active execution to stop and waits for the
    /// capture service to flush its archiver connection.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping scheduler core");
        self.shutdown.cancel();
        let active = self.active.read().await;
        for execution in active.values() {
            execution.cancellation.cancel();
        }
        drop(active);
        self.log_capture.close().await
    }

    // ---- Orphan recovery (startup only, §4.8) ----

    async fn recover_orphans(&self) -> Result<()> {
        let orphans = self.execution_store.get_orphaned_running_jobs().await?;
        if orphans.is_empty() {
            return Ok(());
        }
        warn!(count = orphans.len(), "recovering orphaned running executions");
        for mut execution in orphans {
            execution.status = ExecutionStatus::Failed;
            execution.completed_at = Some(Utc::now());
            execution.error = Some("recovered: orphaned by restart".to_string());
            self.execution_store.update(&execution).await?;

            if let Ok(Some(mut job)) = self.get_job(&execution.job_id).await {
                self.reset_after_interruption(&mut job, "recovered: orphaned by restart")
                    .await?;
            }
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let ready = self.job_store.get_scheduled_jobs().await?;
        Ok(ready.into_iter().find(|j| j.id == job_id))
    }

    // ---- Poll loop ----

    async fn run_poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(self.settings.poll_interval_seconds));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        error!(error = %err, "poll iteration failed");
                    }
                }
            }
        }
    }

    async fn poll_once(self: &Arc<Self>) -> Result<()> {
        let now = Utc::now();
        let ready = self.job_store.get_jobs_ready_to_run(now).await?;
        for job in ready {
            if let Err(err) = self.try_claim_and_run(job).await {
                error!(error = %err, "failed to claim job");
            }
        }
        Ok(())
    }

    /// Attempts the lease-lock CAS acquisition and, on success, spawns the
    /// execution worker. Losing the race is not an error (§3 invariant 1,
    /// §4.7).
    async fn try_claim_and_run(self: &Arc<Self>, mut job: Job) -> Result<()> {
        let token = Id::new().to_string();
        let now = Utc::now();
        let lease = ChronoDuration::seconds(self.settings.lock_lease_seconds);
        let acquired = self.job_store.acquire_lock(&job.id, &token, now, lease).await?;
        if !acquired {
            debug!(job_id = %job.id, "lost lock acquisition race, skipping");
            return Ok(());
        }

        job.lock_token = Some(token);
        job.lock_acquired_at = Some(now);
        state_machine::validate_transition(job.status, JobStatus::Running)?;
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        self.job_store.update(&job).await?;

        let execution_number = self.execution_store.count_by_job_id(&job.id).await? + 1;
        let retry_attempt = job.current_retry_count;
        let execution = JobExecution::new(job.id.clone(), execution_number, retry_attempt);
        self.execution_store.create(&execution).await?;

        let buffer = self
            .log_capture
            .start_capture(&job.id, &execution.id, execution_number)
            .await?;
        let verbosity = if job.adaptive_scheduling {
            Verbosity::Debug
        } else {
            Verbosity::Normal
        };
        let logger = JobLogger::new(
            job.id.clone(),
            execution.id.clone(),
            verbosity,
            buffer,
            Arc::new(MetricsAggregator::new()),
            self.settings.debug_log_rate_per_second,
        );

        let cancellation = CancellationToken::new();
        self.active.write().await.insert(
            execution.id.clone(),
            ActiveExecution {
                cancellation: cancellation.clone(),
                logger: logger.clone(),
            },
        );

        self.live_publisher
            .publish_job_status(&job.id, JobStatus::Running.as_str())
            .await;

        let core = self.clone();
        let execution_id = execution.id.clone();
        tokio::spawn(async move {
            core.run_execution(job, execution_id, cancellation, logger).await;
        });

        Ok(())
    }

    // ---- Execution worker (§4.8) ----

    async fn run_execution(
        self: Arc<Self>,
        job: Job,
        execution_id: String,
        cancellation: CancellationToken,
        logger: JobLogger,
    ) {
        logger.job_started();

        let crawler = self.crawler_factory.create_crawler(&job);
        crawler.set_job_logger(logger.clone());

        let heartbeat_logger = logger.clone();
        let heartbeat_token = cancellation.clone();
        let heartbeat = tokio::spawn(async move {
            heartbeat_logger.run_heartbeat(heartbeat_token).await;
        });

        let run_future = std::panic::AssertUnwindSafe(async {
            tokio::select! {
                _ = cancellation.cancelled() => WorkerOutcome::Cancelled,
                result = async {
                    crawler.start(&job).await?;
                    crawler.wait().await
                } => {
                    match result {
                        Ok(summary) => WorkerOutcome::Completed(summary),
                        Err(err) => WorkerOutcome::Failed(err),
                    }
                }
            }
        });

        let outcome = match run_future.catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => WorkerOutcome::Panicked(panic_message(&payload)),
        };

        heartbeat.abort();

        let adaptive_next_run = if job.is_recurring() {
            match &outcome {
                WorkerOutcome::Completed(_) => Some(self.compute_adaptive_next_run(&job, &crawler).await),
                _ => None,
            }
        } else {
            None
        };

        let (object_key, size_bytes, line_count) = self
            .log_capture
            .stop_capture(&execution_id)
            .await
            .unwrap_or_default();

        self.finish_execution(
            job,
            execution_id.clone(),
            outcome,
            logger,
            object_key,
            size_bytes,
            line_count,
            adaptive_next_run,
        )
        .await;
        self.active.write().await.remove(&execution_id);
    }

    /// Computes the adaptive next-run time while `crawler` is still in
    /// scope, via the content-hash-tracker collaborator. Falls back to
    /// `None` (fixed/bucket-map scheduling) if the job has no tracker, no
    /// start-url hash, or the tracker call fails (§4.8 "adaptive
    /// scheduling").
    async fn compute_adaptive_next_run(
        &self,
        job: &Job,
        crawler: &Arc<dyn Crawler>,
    ) -> DateTime<Utc> {
        let fallback = || {
            self.bucket_map
                .calculate_next_run_preserve_rhythm(&job.id, job.interval())
        };

        if !job.adaptive_scheduling {
            return fallback();
        }

        let (Some(tracker), Some(hash)) = (crawler.get_hash_tracker(), crawler.get_start_url_hash()) else {
            return fallback();
        };

        match tracker
            .compare_and_update(&job.source_id, &hash, job.interval())
            .await
        {
            Ok(interval) => Utc::now() + interval,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "hash tracker unavailable, falling back to fixed scheduling");
                fallback()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_execution(
        &self,
        mut job: Job,
        execution_id: String,
        outcome: WorkerOutcome,
        logger: JobLogger,
        object_key: String,
        size_bytes: u64,
        line_count: u64,
        adaptive_next_run: Option<DateTime<Utc>>,
    ) {
        let mut execution = match self.execution_store.get_by_id(&execution_id).await {
            Ok(Some(execution)) => execution,
            _ => JobExecution::new(job.id.clone(), 0, job.current_retry_count),
        };

        let completed_at = Utc::now();
        execution.completed_at = Some(completed_at);
        execution.duration_ms = Some(
            (completed_at - execution.started_at).num_milliseconds().max(0) as u64,
        );
        if !object_key.is_empty() {
            execution.log_object_key = Some(object_key);
            execution.log_size_bytes = Some(size_bytes);
            execution.log_line_count = Some(line_count);
        }

        match outcome {
            WorkerOutcome::Completed(summary) => {
                execution.status = ExecutionStatus::Completed;
                execution.items_crawled = summary.pages_crawled;
                execution.items_indexed = summary.extraction_quality.items_indexed;
                execution.metadata = serde_json::to_value(&summary).unwrap_or_default();
                logger.job_completed(&summary);

                job.current_retry_count = 0;
                job.last_error = None;
                job.completed_at = Some(completed_at);
                job.status = JobStatus::Completed;
                if job.is_recurring() {
                    let next = adaptive_next_run.unwrap_or_else(|| {
                        self.bucket_map
                            .calculate_next_run_preserve_rhythm(&job.id, job.interval())
                    });
                    job.next_run_at = Some(next);
                    job.status = JobStatus::Scheduled;
                } else {
                    job.next_run_at = None;
                }

                self.live_publisher
                    .publish_job_completed(&job.id, &execution_id, &summary)
                    .await;
            }
            WorkerOutcome::Failed(err) => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(err.to_string());
                logger.job_failed(&err.to_string());
                if let Err(err) = self.apply_retry_or_terminal(&mut job, &err.to_string()) {
                    warn!(job_id = %job.id, error = %err, "failed to apply retry/terminal transition");
                }
            }
            WorkerOutcome::Panicked(payload) => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(payload.clone());
                logger.job_failed(&payload);
                if let Err(err) = self.reset_after_interruption(&mut job, &payload).await {
                    warn!(job_id = %job.id, error = %err, "failed to reset job after panic");
                }
            }
            WorkerOutcome::Cancelled => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some("execution cancelled".to_string());
                job.status = JobStatus::Cancelled;
                job.next_run_at = None;
            }
        }

        let lock_token = job.lock_token.clone().unwrap_or_default();
        job.lock_token = None;
        job.lock_acquired_at = None;

        if let Err(err) = self.job_store.release_lock(&job.id, &lock_token).await {
            warn!(job_id = %job.id, error = %err, "failed to release job lock, relying on lease expiry");
        }
        let _ = self.execution_store.update(&execution).await;
        let _ = self.job_store.update(&job).await;
        self.live_publisher
            .publish_job_status(&job.id, job.status.as_str())
            .await;
    }

    /// Ordinary failure path: retries with exponential backoff up to
    /// `max_retries`, then falls terminal. The retry branch re-enters
    /// `Scheduled` (not `Pending`, which `Running` cannot transition to)
    /// (§4.6, §4.8).
    fn apply_retry_or_terminal(&self, job: &mut Job, reason: &str) -> Result<()> {
        job.last_error = Some(reason.to_string());
        if job.current_retry_count < job.max_retries {
            job.current_retry_count += 1;
            let backoff = backoff_seconds(job.retry_backoff_base_seconds, job.current_retry_count);
            state_machine::validate_transition(job.status, JobStatus::Scheduled)?;
            job.status = JobStatus::Scheduled;
            job.next_run_at = Some(Utc::now() + ChronoDuration::seconds(backoff));
        } else {
            state_machine::validate_transition(job.status, JobStatus::Failed)?;
            job.status = JobStatus::Failed;
            job.next_run_at = None;
        }
        Ok(())
    }

    /// Interruption recovery path, distinct from the ordinary retry ladder:
    /// used for orphaned-at-startup and stuck-execution recoveries, neither
    /// of which count against `current_retry_count` or apply backoff.
    /// Recurring jobs go back to `Scheduled` via the bucket map; one-shot
    /// jobs go straight to `Failed` (§4.8).
    async fn reset_after_interruption(&self, job: &mut Job, reason: &str) -> Result<()> {
        job.last_error = Some(reason.to_string());
        job.lock_token = None;
        job.lock_acquired_at = None;
        if job.is_recurring() {
            state_machine::validate_transition(job.status, JobStatus::Scheduled)?;
            job.next_run_at = Some(
                self.bucket_map
                    .calculate_next_run_preserve_rhythm(&job.id, job.interval()),
            );
            job.status = JobStatus::Scheduled;
        } else {
            state_machine::validate_transition(job.status, JobStatus::Failed)?;
            job.status = JobStatus::Failed;
            job.next_run_at = None;
        }
        self.job_store.update(job).await
    }

    // ---- Stale lock sweep (§4.7) ----

    async fn run_stale_lock_sweep(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(StdDuration::from_secs(self.settings.stale_lock_sweep_interval_seconds));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cutoff = Utc::now() - ChronoDuration::seconds(self.settings.lock_lease_seconds);
                    match self.job_store.clear_stale_locks(cutoff).await {
                        Ok(count) if count > 0 => info!(count, "cleared stale job locks"),
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "stale lock sweep failed"),
                    }
                }
            }
        }
    }

    // ---- Stuck job sweep (§4.8) ----

    async fn run_stuck_job_sweep(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(StdDuration::from_secs(self.settings.stuck_job_sweep_interval_seconds));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_stuck_jobs().await {
                        error!(error = %err, "stuck job sweep failed");
                    }
                }
            }
        }
    }

    /// Executions still tracked in `self.active` are left alone: their own
    /// cancellation-bearing context will stop them on its own once the
    /// heartbeat/run future notices. This sweep only deals with executions
    /// that outlived their owning replica's bookkeeping entirely (§4.8).
    async fn sweep_stuck_jobs(&self) -> Result<()> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.settings.execution_timeout_seconds);
        let stuck = self.execution_store.get_stuck_jobs(cutoff).await?;
        for mut execution in stuck {
            if self.active.read().await.contains_key(&execution.id) {
                continue;
            }
            warn!(execution_id = %execution.id, "forcing stuck execution to failed");
            execution.status = ExecutionStatus::Failed;
            execution.completed_at = Some(Utc::now());
            execution.error = Some("recovered: exceeded maximum execution time.".to_string());
            self.execution_store.update(&execution).await?;

            if let Ok(Some(mut job)) = self.get_job(&execution.job_id).await {
                self.reset_after_interruption(&mut job, "recovered: exceeded maximum execution time.")
                    .await?;
            }
        }
        Ok(())
    }

    // ---- Metrics rollup loop (§4.4) ----

    /// Periodically rolls each active execution's logger metrics into its
    /// summary and pushes it to the live publisher, so subscribers watching
    /// a long-running job see progress before it completes.
    async fn run_metrics_rollup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(
            self.settings.metrics_rollup_interval_seconds,
        ));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.roll_up_active_metrics().await;
                }
            }
        }
    }

    async fn roll_up_active_metrics(&self) {
        let active = self.active.read().await;
        for (execution_id, execution) in active.iter() {
            let summary = execution.logger.build_summary();
            debug!(
                execution_id = %execution_id,
                pages_crawled = summary.pages_crawled,
                errors = summary.errors,
                logs_throttled = summary.logs_throttled,
                "metrics rollup"
            );
        }
    }

    // ---- Live job-control API (§4.8) ----

    pub async fn cancel_job(&self, execution_id: &str) -> Result<()> {
        let mut active = self.active.write().await;
        let execution = active
            .remove(execution_id)
            .ok_or_else(|| Error::NotFound(format!("no active execution {execution_id}")))?;
        execution.cancellation.cancel();
        Ok(())
    }

    pub async fn schedule_new_job(&self, mut job: Job) -> Result<Job> {
        state_machine::validate_transition(job.status, JobStatus::Scheduled)?;
        job.status = JobStatus::Scheduled;
        if job.is_recurring() {
            job.next_run_at = Some(self.bucket_map.place_new_job(&job.id, job.interval()));
        }
        self.job_store.update(&job).await?;
        Ok(job)
    }

    pub async fn handle_job_deleted(&self, job_id: &str) -> Result<()> {
        self.bucket_map.remove_job(job_id);
        Ok(())
    }

    pub async fn handle_interval_change(&self, job: &mut Job) -> Result<()> {
        if job.is_recurring() {
            job.next_run_at = Some(
                self.bucket_map
                    .calculate_next_run_preserve_rhythm(&job.id, job.interval()),
            );
        }
        self.job_store.update(job).await
    }

    pub async fn handle_resume(&self, job: &mut Job) -> Result<()> {
        state_machine::validate_transition(job.status, JobStatus::Scheduled)?;
        job.status = JobStatus::Scheduled;
        if job.is_recurring() {
            job.next_run_at = Some(
                self.bucket_map
                    .calculate_next_run_preserve_rhythm(&job.id, job.interval()),
            );
        }
        self.job_store.update(job).await
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// §4.8 "Retry with backoff": `base * 2^(attempt - 1)`, so the first retry
/// waits exactly `base` seconds, the second `2*base`, and so on, capped at
/// `MAX_BACKOFF_SECONDS`.
fn backoff_seconds(base_seconds: i64, attempt: u32) -> i64 {
    let exp = base_seconds.saturating_mul(1i64 << attempt.saturating_sub(1).min(16));
    exp.min(MAX_BACKOFF_SECONDS).max(base_seconds)
}

fn instance_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{hostname}:{}", std::process::id())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("panic: {detail}")
}

enum WorkerOutcome {
    Completed(JobSummary),
    Failed(Error),
    Cancelled,
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_seconds(60, 1), 60);
        assert_eq!(backoff_seconds(60, 2), 120);
        assert_eq!(backoff_seconds(60, 3), 240);
        assert_eq!(backoff_seconds(60, 10), MAX_BACKOFF_SECONDS);
    }

    #[test]
    fn panic_message_extracts_str_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "panic: boom");
    }

    #[test]
    fn panic_message_extracts_string_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(payload.as_ref()), "panic: boom");
    }

    fn recurring_job() -> Job {
        let mut job = Job::new("source-1".into(), "https://example.com".into());
        job.status = JobStatus::Running;
        job.schedule_enabled = true;
        job.interval_magnitude = 60;
        job.interval_unit = crate::types::IntervalUnit::Minutes;
        job
    }

    fn one_shot_job() -> Job {
        let mut job = Job::new("source-1".into(), "https://example.com".into());
        job.status = JobStatus::Running;
        job
    }

    fn core_with_inmemory_stores(
        crawler: Arc<crate::inmemory::ScriptedCrawler>,
    ) -> (Arc<IntervalSchedulerCore>, Arc<crate::inmemory::InMemoryJobStore>) {
        let job_store = Arc::new(crate::inmemory::InMemoryJobStore::new());
        let execution_store = Arc::new(crate::inmemory::InMemoryExecutionStore::new());
        let factory = Arc::new(crate::inmemory::ScriptedCrawlerFactory::new(crawler));
        let core = Arc::new(IntervalSchedulerCore::new(
            SchedulerSettings::default(),
            job_store.clone(),
            execution_store,
            factory,
            Arc::new(crate::collaborators::DisabledLogArchiver),
            Arc::new(crate::collaborators::NoopLivePublisher),
        ));
        (core, job_store)
    }

    #[tokio::test]
    async fn reset_after_interruption_reschedules_recurring_jobs() {
        let (core, _job_store) = core_with_inmemory_stores(crate::inmemory::ScriptedCrawler::succeeding(
            JobSummary::default(),
        ));
        let mut job = recurring_job();
        core.reset_after_interruption(&mut job, "recovered: orphaned by restart")
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(job.next_run_at.is_some());
        assert_eq!(job.last_error.as_deref(), Some("recovered: orphaned by restart"));
    }

    #[tokio::test]
    async fn reset_after_interruption_fails_one_shot_jobs() {
        let (core, _job_store) =
            core_with_inmemory_stores(crate::inmemory::ScriptedCrawler::succeeding(JobSummary::default()));
        let mut job = one_shot_job();
        core.reset_after_interruption(&mut job, "recovered: exceeded maximum execution time.")
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.next_run_at.is_none());
    }

    #[test]
    fn apply_retry_or_terminal_schedules_within_retry_budget() {
        let (core, _job_store) =
            core_with_inmemory_stores(crate::inmemory::ScriptedCrawler::succeeding(JobSummary::default()));
        let mut job = recurring_job();
        job.max_retries = 3;
        core.apply_retry_or_terminal(&mut job, "boom").unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.current_retry_count, 1);
        assert!(job.next_run_at.is_some());
    }

    #[test]
    fn apply_retry_or_terminal_fails_terminal_once_retries_exhausted() {
        let (core, _job_store) =
            core_with_inmemory_stores(crate::inmemory::ScriptedCrawler::succeeding(JobSummary::default()));
        let mut job = recurring_job();
        job.max_retries = 0;
        core.apply_retry_or_terminal(&mut job, "boom").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.next_run_at.is_none());
    }

    #[tokio::test]
    async fn compute_adaptive_next_run_falls_back_without_adaptive_scheduling() {
        let tracker: Arc<dyn crate::collaborators::ContentHashTracker> =
            Arc::new(crate::inmemory::InMemoryHashTracker::default());
        let crawler = crate::inmemory::ScriptedCrawler::succeeding_with_tracker(
            JobSummary::default(),
            tracker,
            "hash-1",
        );
        let (core, _job_store) = core_with_inmemory_stores(crawler.clone());
        let mut job = recurring_job();
        job.adaptive_scheduling = false;
        let crawler_dyn: Arc<dyn Crawler> = crawler;

        let before = Utc::now() + job.interval();
        let next = core.compute_adaptive_next_run(&job, &crawler_dyn).await;
        // falls back to bucket-map placement, not a tracker-derived interval
        assert!(next <= before + ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn compute_adaptive_next_run_uses_tracker_when_enabled() {
        let tracker: Arc<dyn crate::collaborators::ContentHashTracker> =
            Arc::new(crate::inmemory::InMemoryHashTracker::default());
        let crawler = crate::inmemory::ScriptedCrawler::succeeding_with_tracker(
            JobSummary::default(),
            tracker,
            "hash-1",
        );
        let (core, _job_store) = core_with_inmemory_stores(crawler.clone());
        let mut job = recurring_job();
        job.adaptive_scheduling = true;
        let crawler_dyn: Arc<dyn Crawler> = crawler;

        let now = Utc::now();
        let next = core.compute_adaptive_next_run(&job, &crawler_dyn).await;
        // first comparison always reports "changed", so the tracker shrinks
        // the interval below the job's fixed 60-minute baseline.
        assert!(next < now + job.interval());
    }

    #[tokio::test]
    async fn compute_adaptive_next_run_falls_back_when_tracker_errors() {
        let tracker: Arc<dyn crate::collaborators::ContentHashTracker> =
            Arc::new(crate::inmemory::FailingHashTracker);
        let crawler = crate::inmemory::ScriptedCrawler::succeeding_with_tracker(
            JobSummary::default(),
            tracker,
            "hash-1",
        );
        let (core, _job_store) = core_with_inmemory_stores(crawler.clone());
        let mut job = recurring_job();
        job.adaptive_scheduling = true;
        let crawler_dyn: Arc<dyn Crawler> = crawler;

        let before = Utc::now() + job.interval();
        let next = core.compute_adaptive_next_run(&job, &crawler_dyn).await;
        assert!(next <= before + ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn claim_and_run_reaches_scheduled_with_adaptive_next_run() {
        let tracker: Arc<dyn crate::collaborators::ContentHashTracker> =
            Arc::new(crate::inmemory::InMemoryHashTracker::default());
        let crawler = crate::inmemory::ScriptedCrawler::succeeding_with_tracker(
            JobSummary::default(),
            tracker,
            "hash-1",
        );
        let (core, job_store) = core_with_inmemory_stores(crawler);

        let mut job = Job::new("source-1".into(), "https://example.com".into());
        job.status = JobStatus::Scheduled;
        job.schedule_enabled = true;
        job.adaptive_scheduling = true;
        job.interval_magnitude = 60;
        job.interval_unit = crate::types::IntervalUnit::Minutes;
        job.next_run_at = Some(Utc::now());
        job_store.insert(job.clone()).await;

        core.poll_once().await.unwrap();

        let mut updated = job_store.get(&job.id).await;
        for _ in 0..100 {
            if let Some(j) = &updated {
                if j.status != JobStatus::Running {
                    break;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            updated = job_store.get(&job.id).await;
        }

        let updated = updated.expect("job still present");
        assert_eq!(updated.status, JobStatus::Scheduled);
        assert!(updated.next_run_at.unwrap() < Utc::now() + job.interval());
        assert!(updated.lock_token.is_none());
    }
}
