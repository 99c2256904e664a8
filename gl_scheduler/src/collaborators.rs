//! ABOUTME: Trait contracts the scheduler core depends on but does not implement
//! ABOUTME: Job/execution persistence, the crawler, content dedup, live updates, and archival

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gl_core::Result;

use crate::job_logger::JobLogger;
use crate::types::{AggregateStats, Job, JobExecution, JobSummary};

/// Persists and retrieves `Job` rows, including lease-lock bookkeeping (§6).
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_jobs_ready_to_run(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;
    async fn get_scheduled_jobs(&self) -> Result<Vec<Job>>;
    async fn update(&self, job: &Job) -> Result<()>;

    /// Attempts to acquire the lease lock with a fresh `token`. Succeeds, in
    /// one atomic step, when the current lock is absent or its `lease` has
    /// expired (`lock_acquired_at + lease <= now`) — a crashed replica's lock
    /// is reclaimable immediately, without waiting on the stale-lock sweep
    /// (§3 invariant 1, §4.7 "Lock protocol").
    async fn acquire_lock(
        &self,
        job_id: &str,
        token: &str,
        now: DateTime<Utc>,
        lease: ChronoDuration,
    ) -> Result<bool>;

    /// Releases the lock only if `token` still matches what's stored,
    /// preventing a replica from releasing a lock it no longer owns after
    /// its lease expired and another replica took over (§4.7).
    async fn release_lock(&self, job_id: &str, token: &str) -> Result<()>;

    /// Clears locks whose lease has expired, regardless of token (§4.7 sweep).
    async fn clear_stale_locks(&self, lease_expired_before: DateTime<Utc>) -> Result<u64>;
}

/// Persists `JobExecution` rows and derives aggregate statistics (§6).
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create(&self, execution: &JobExecution) -> Result<()>;
    async fn update(&self, execution: &JobExecution) -> Result<()>;
    async fn get_by_id(&self, id: &str) -> Result<Option<JobExecution>>;
    async fn count_by_job_id(&self, job_id: &str) -> Result<u64>;
    async fn get_latest_by_job_id(&self, job_id: &str) -> Result<Option<JobExecution>>;

    /// Executions left `running` with no owning replica, found at startup
    /// (§4.8 orphan recovery).
    async fn get_orphaned_running_jobs(&self) -> Result<Vec<JobExecution>>;

    /// Executions that have been `running` longer than the configured
    /// timeout (§4.8 stuck-job sweep).
    async fn get_stuck_jobs(&self, running_longer_than: DateTime<Utc>) -> Result<Vec<JobExecution>>;

    async fn get_aggregate_stats(&self) -> Result<AggregateStats>;
}

/// The crawling work itself. Opaque to the scheduler core beyond
/// start/wait/cancel and the hash tracker it exposes for deduplication (§6).
#[async_trait]
pub trait Crawler: Send + Sync {
    fn set_job_logger(&self, logger: JobLogger);
    fn get_job_logger(&self) -> Option<JobLogger>;

    /// Begins crawling; returns immediately, the work proceeds until `wait`
    /// observes completion or the execution's cancellation token fires.
    async fn start(&self, job: &Job) -> Result<()>;

    /// Blocks until the crawl finishes (successfully, with an error, or via
    /// cancellation) and returns its summary.
    async fn wait(&self) -> Result<JobSummary>;

    fn get_hash_tracker(&self) -> Option<std::sync::Arc<dyn ContentHashTracker>>;
    fn get_start_url_hash(&self) -> Option<String>;
}

/// Builds a fresh `Crawler` for each execution, since a crawler instance
/// carries per-run state (its job logger, hash tracker handle) that must not
/// leak across executions of the same job (§6).
pub trait CrawlerFactory: Send + Sync {
    fn create_crawler(&self, job: &Job) -> std::sync::Arc<dyn Crawler>;
}

/// Deduplicates crawled content by hash and adapts a recurring job's
/// interval to how often its content actually changes (§4.8 "adaptive
/// scheduling").
#[async_trait]
pub trait ContentHashTracker: Send + Sync {
    /// Records `hash` as the latest value seen for `source_id` and returns
    /// the interval the job should next run at, nudged away from `baseline`
    /// depending on whether the content changed since the last comparison.
    async fn compare_and_update(
        &self,
        source_id: &str,
        hash: &str,
        baseline: ChronoDuration,
    ) -> Result<ChronoDuration>;
}

/// Pushes real-time status to subscribers (a websocket hub, SSE stream, or
/// similar). All methods are best-effort: a publish failure must never fail
/// the execution it's reporting on (§6, §7).
#[async_trait]
pub trait LivePublisher: Send + Sync {
    async fn publish_job_status(&self, job_id: &str, status: &str);
    async fn publish_job_completed(&self, job_id: &str, execution_id: &str, summary: &JobSummary);
    async fn publish_log_line(&self, job_id: &str, execution_id: &str, line: &str);
    async fn publish_log_archived(&self, job_id: &str, execution_id: &str, object_key: &str);
}

/// No-op publisher for deployments (and tests) with no live subscribers.
pub struct NoopLivePublisher;

#[async_trait]
impl LivePublisher for NoopLivePublisher {
    async fn publish_job_status(&self, _job_id: &str, _status: &str) {}
    async fn publish_job_completed(&self, _job_id: &str, _execution_id: &str, _summary: &JobSummary) {}
    async fn publish_log_line(&self, _job_id: &str, _execution_id: &str, _line: &str) {}
    async fn publish_log_archived(&self, _job_id: &str, _execution_id: &str, _object_key: &str) {}
}

/// One execution's gzipped log bytes plus the metadata an archiver attaches
/// to the stored object (§6 "Archive(ctx, task) -> objectKey"): content type
/// `application/gzip`, and `job_id`/`execution_id`/`execution_number`/
/// `line_count`/`started_at` as user metadata alongside the upload.
/// `archived_at` is stamped by the archiver itself at upload time.
pub struct ArchiveTask {
    pub job_id: String,
    pub execution_id: String,
    pub execution_number: u64,
    pub gzipped_bytes: Vec<u8>,
    pub line_count: u64,
    pub started_at: DateTime<Utc>,
}

/// Durable storage for completed executions' gzipped log bytes (§6).
#[async_trait]
pub trait LogArchiver: Send + Sync {
    /// Stores `task` and returns the object key it was stored under, built
    /// as `logs/{jobId}/{executionNumber}.log.gz` (§6). An empty key means
    /// nothing was stored (e.g. archival disabled).
    async fn archive(&self, task: ArchiveTask) -> Result<String>;
    async fn get_object(&self, object_key: &str) -> Result<Vec<u8>>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Archival disabled: `archive` is a silent no-op, `get_object` always
/// reports not-found (§4.4 "archival is optional").
pub struct DisabledLogArchiver;

#[async_trait]
impl LogArchiver for DisabledLogArchiver {
    async fn archive(&self, _task: ArchiveTask) -> Result<String> {
        Ok(String::new())
    }

    async fn get_object(&self, object_key: &str) -> Result<Vec<u8>> {
        Err(gl_core::Error::NotFound(format!(
            "log archival is disabled: {object_key}"
        )))
    }
}
