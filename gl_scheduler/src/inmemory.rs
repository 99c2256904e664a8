//! ABOUTME: In-memory fakes of the collaborator traits, for tests only
//! ABOUTME: Not a reference implementation; no persistence, no real crawling

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gl_core::Result;
use tokio::sync::{Mutex, RwLock};

use crate::collaborators::{ContentHashTracker, Crawler, CrawlerFactory, ExecutionStore, JobStore};
use crate::job_logger::JobLogger;
use crate::types::{AggregateStats, Job, JobExecution, JobSummary};

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().await.get(job_id).cloned()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_jobs_ready_to_run(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| {
                j.schedule_enabled
                    && j.next_run_at.map(|t| t <= now).unwrap_or(false)
                    && j.lock_token.is_none()
            })
            .cloned()
            .collect())
    }

    async fn get_scheduled_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn acquire_lock(
        &self,
        job_id: &str,
        token: &str,
        now: DateTime<Utc>,
        lease: ChronoDuration,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(false);
        };
        let expired = match (job.lock_token.as_ref(), job.lock_acquired_at) {
            (Some(_), Some(acquired_at)) => acquired_at + lease <= now,
            (Some(_), None) => true,
            (None, _) => true,
        };
        if !expired {
            return Ok(false);
        }
        job.lock_token = Some(token.to_string());
        job.lock_acquired_at = Some(now);
        Ok(true)
    }

    async fn release_lock(&self, job_id: &str, token: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(job_id) {
            if job.lock_token.as_deref() == Some(token) {
                job.lock_token = None;
                job.lock_acquired_at = None;
            }
        }
        Ok(())
    }

    async fn clear_stale_locks(&self, lease_expired_before: DateTime<Utc>) -> Result<u64> {
        let mut cleared = 0;
        let mut jobs = self.jobs.write().await;
        for job in jobs.values_mut() {
            if let Some(acquired_at) = job.lock_acquired_at {
                if acquired_at < lease_expired_before {
                    job.lock_token = None;
                    job.lock_acquired_at = None;
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }
}

#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<String, JobExecution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, execution: &JobExecution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn update(&self, execution: &JobExecution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<JobExecution>> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn count_by_job_id(&self, job_id: &str) -> Result<u64> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.job_id == job_id)
            .count() as u64)
    }

    async fn get_latest_by_job_id(&self, job_id: &str) -> Result<Option<JobExecution>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.job_id == job_id)
            .max_by_key(|e| e.execution_number)
            .cloned())
    }

    async fn get_orphaned_running_jobs(&self) -> Result<Vec<JobExecution>> {
        Ok(Vec::new())
    }

    async fn get_stuck_jobs(&self, running_longer_than: DateTime<Utc>) -> Result<Vec<JobExecution>> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| {
                e.completed_at.is_none() && e.started_at < running_longer_than
            })
            .cloned()
            .collect())
    }

    async fn get_aggregate_stats(&self) -> Result<AggregateStats> {
        let executions = self.executions.read().await;
        let total = executions.len();
        let completed = executions
            .values()
            .filter(|e| matches!(e.status, crate::types::ExecutionStatus::Completed))
            .count();
        let durations: Vec<u64> = executions.values().filter_map(|e| e.duration_ms).collect();
        let avg_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
        };
        Ok(AggregateStats {
            avg_duration_ms,
            success_rate: if total > 0 {
                completed as f64 / total as f64
            } else {
                0.0
            },
            active_jobs: 0,
            scheduled_jobs: 0,
        })
    }
}

/// A scripted crawler: completes immediately with a pre-baked summary, or
/// returns a pre-baked error, so scheduler tests don't need a real crawl
/// implementation.
pub struct ScriptedCrawler {
    outcome: Mutex<Option<Result<JobSummary>>>,
    logger: std::sync::Mutex<Option<JobLogger>>,
    hash_tracker: Option<Arc<dyn ContentHashTracker>>,
    start_url_hash: Option<String>,
}

impl ScriptedCrawler {
    pub fn succeeding(summary: JobSummary) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Some(Ok(summary))),
            logger: std::sync::Mutex::new(None),
            hash_tracker: None,
            start_url_hash: None,
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Some(Err(gl_core::Error::External(message.to_string())))),
            logger: std::sync::Mutex::new(None),
            hash_tracker: None,
            start_url_hash: None,
        })
    }

    /// Like [`Self::succeeding`], but exposes a hash tracker and start-url
    /// hash, for testing the adaptive-scheduling collaborator path.
    pub fn succeeding_with_tracker(
        summary: JobSummary,
        hash_tracker: Arc<dyn ContentHashTracker>,
        start_url_hash: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Some(Ok(summary))),
            logger: std::sync::Mutex::new(None),
            hash_tracker: Some(hash_tracker),
            start_url_hash: Some(start_url_hash.to_string()),
        })
    }
}

#[async_trait]
impl Crawler for ScriptedCrawler {
    fn set_job_logger(&self, logger: JobLogger) {
        *self.logger.lock().expect("scripted crawler logger lock poisoned") = Some(logger);
    }

    fn get_job_logger(&self) -> Option<JobLogger> {
        self.logger.lock().expect("scripted crawler logger lock poisoned").clone()
    }

    async fn start(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    async fn wait(&self) -> Result<JobSummary> {
        self.outcome
            .lock()
            .await
            .take()
            .unwrap_or_else(|| Ok(JobSummary::default()))
    }

    fn get_hash_tracker(&self) -> Option<Arc<dyn ContentHashTracker>> {
        self.hash_tracker.clone()
    }

    fn get_start_url_hash(&self) -> Option<String> {
        self.start_url_hash.clone()
    }
}

pub struct ScriptedCrawlerFactory {
    crawler: Arc<ScriptedCrawler>,
}

impl ScriptedCrawlerFactory {
    pub fn new(crawler: Arc<ScriptedCrawler>) -> Self {
        Self { crawler }
    }
}

impl CrawlerFactory for ScriptedCrawlerFactory {
    fn create_crawler(&self, _job: &Job) -> Arc<dyn Crawler> {
        self.crawler.clone()
    }
}

#[derive(Default)]
pub struct InMemoryHashTracker {
    hashes: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ContentHashTracker for InMemoryHashTracker {
    async fn compare_and_update(
        &self,
        source_id: &str,
        hash: &str,
        baseline: ChronoDuration,
    ) -> Result<ChronoDuration> {
        let mut hashes = self.hashes.lock().await;
        let changed = hashes.get(source_id).map(|h| h != hash).unwrap_or(true);
        hashes.insert(source_id.to_string(), hash.to_string());
        let factor = if changed { 0.75 } else { 1.25 };
        let adjusted_ms = (baseline.num_milliseconds() as f64 * factor) as i64;
        Ok(ChronoDuration::milliseconds(adjusted_ms))
    }
}

/// Always errors, for testing the adaptive-scheduling fallback-to-fixed path.
#[derive(Default)]
pub struct FailingHashTracker;

#[async_trait]
impl ContentHashTracker for FailingHashTracker {
    async fn compare_and_update(
        &self,
        _source_id: &str,
        _hash: &str,
        _baseline: ChronoDuration,
    ) -> Result<ChronoDuration> {
        Err(gl_core::Error::External("hash tracker unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_store_lock_acquisition_is_exclusive() {
        let store = InMemoryJobStore::new();
        let job = Job::new("source-1".into(), "https://example.com".into());
        store.insert(job.clone()).await;

        let now = Utc::now();
        let lease = ChronoDuration::seconds(300);
        assert!(store
            .acquire_lock(&job.id, "token-a", now, lease)
            .await
            .unwrap());
        assert!(!store
            .acquire_lock(&job.id, "token-b", now, lease)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn job_store_lock_is_reclaimable_once_lease_expires() {
        let store = InMemoryJobStore::new();
        let job = Job::new("source-1".into(), "https://example.com".into());
        store.insert(job.clone()).await;

        let now = Utc::now();
        let lease = ChronoDuration::seconds(300);
        assert!(store
            .acquire_lock(&job.id, "token-a", now, lease)
            .await
            .unwrap());

        let past_expiry = now + lease + ChronoDuration::seconds(1);
        assert!(store
            .acquire_lock(&job.id, "token-b", past_expiry, lease)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn hash_tracker_shrinks_interval_on_change_and_grows_on_no_change() {
        let tracker = InMemoryHashTracker::default();
        let baseline = ChronoDuration::seconds(1_000);

        let first = tracker
            .compare_and_update("https://a", "hash1", baseline)
            .await
            .unwrap();
        assert!(first < baseline);

        let second = tracker
            .compare_and_update("https://a", "hash1", baseline)
            .await
            .unwrap();
        assert!(second > baseline);

        let third = tracker
            .compare_and_update("https://a", "hash2", baseline)
            .await
            .unwrap();
        assert!(third < baseline);
    }

    #[tokio::test]
    async fn failing_hash_tracker_always_errors() {
        let tracker = FailingHashTracker;
        assert!(tracker
            .compare_and_update("https://a", "hash1", ChronoDuration::seconds(1_000))
            .await
            .is_err());
    }
}
