//! ABOUTME: SQLite-backed JobStore/ExecutionStore, feature-gated behind `sqlite`
//! ABOUTME: CAS lease locking via a conditional UPDATE, not a separate lock table

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gl_core::{Error, Result};
use sqlx::{Row, SqlitePool};

use crate::collaborators::{ExecutionStore, JobStore};
use crate::state_machine::JobStatus;
use crate::types::{AggregateStats, ExecutionStatus, IntervalUnit, Job, JobExecution};

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                seed_url TEXT NOT NULL,
                status TEXT NOT NULL,
                interval_magnitude INTEGER NOT NULL,
                interval_unit TEXT NOT NULL,
                schedule_enabled INTEGER NOT NULL,
                adaptive_scheduling INTEGER NOT NULL,
                current_retry_count INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                retry_backoff_base_seconds INTEGER NOT NULL,
                next_run_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                lock_token TEXT,
                lock_acquired_at TEXT,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to create jobs table: {e}")))?;
        Ok(())
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
        let status_str: String = row.try_get("status").map_err(db_err)?;
        let interval_unit_str: String = row.try_get("interval_unit").map_err(db_err)?;
        Ok(Job {
            id: row.try_get("id").map_err(db_err)?,
            source_id: row.try_get("source_id").map_err(db_err)?,
            seed_url: row.try_get("seed_url").map_err(db_err)?,
            status: parse_status(&status_str)?,
            interval_magnitude: row.try_get::<i64, _>("interval_magnitude").map_err(db_err)? as u32,
            interval_unit: parse_interval_unit(&interval_unit_str)?,
            schedule_enabled: row.try_get("schedule_enabled").map_err(db_err)?,
            adaptive_scheduling: row.try_get("adaptive_scheduling").map_err(db_err)?,
            current_retry_count: row.try_get::<i64, _>("current_retry_count").map_err(db_err)? as u32,
            max_retries: row.try_get::<i64, _>("max_retries").map_err(db_err)? as u32,
            retry_backoff_base_seconds: row.try_get("retry_backoff_base_seconds").map_err(db_err)?,
            next_run_at: row.try_get("next_run_at").map_err(db_err)?,
            started_at: row.try_get("started_at").map_err(db_err)?,
            completed_at: row.try_get("completed_at").map_err(db_err)?,
            lock_token: row.try_get("lock_token").map_err(db_err)?,
            lock_acquired_at: row.try_get("lock_acquired_at").map_err(db_err)?,
            last_error: row.try_get("last_error").map_err(db_err)?,
        })
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn parse_status(s: &str) -> Result<JobStatus> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "scheduled" => Ok(JobStatus::Scheduled),
        "paused" => Ok(JobStatus::Paused),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(Error::Database(format!("invalid job status {other}"))),
    }
}

fn parse_interval_unit(s: &str) -> Result<IntervalUnit> {
    match s {
        "minutes" => Ok(IntervalUnit::Minutes),
        "hours" => Ok(IntervalUnit::Hours),
        "days" => Ok(IntervalUnit::Days),
        other => Err(Error::Database(format!("invalid interval unit {other}"))),
    }
}

fn interval_unit_str(unit: IntervalUnit) -> &'static str {
    match unit {
        IntervalUnit::Minutes => "minutes",
        IntervalUnit::Hours => "hours",
        IntervalUnit::Days => "days",
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn get_jobs_ready_to_run(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE schedule_enabled = 1 AND lock_token IS NULL AND next_run_at <= ?",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn get_scheduled_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn update(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, source_id, seed_url, status, interval_magnitude, interval_unit,
                schedule_enabled, adaptive_scheduling, current_retry_count, max_retries,
                retry_backoff_base_seconds, next_run_at, started_at, completed_at,
                lock_token, lock_acquired_at, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                interval_magnitude = excluded.interval_magnitude,
                interval_unit = excluded.interval_unit,
                schedule_enabled = excluded.schedule_enabled,
                adaptive_scheduling = excluded.adaptive_scheduling,
                current_retry_count = excluded.current_retry_count,
                max_retries = excluded.max_retries,
                retry_backoff_base_seconds = excluded.retry_backoff_base_seconds,
                next_run_at = excluded.next_run_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                lock_token = excluded.lock_token,
                lock_acquired_at = excluded.lock_acquired_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(&job.id)
        .bind(&job.source_id)
        .bind(&job.seed_url)
        .bind(job.status.as_str())
        .bind(job.interval_magnitude as i64)
        .bind(interval_unit_str(job.interval_unit))
        .bind(job.schedule_enabled)
        .bind(job.adaptive_scheduling)
        .bind(job.current_retry_count as i64)
        .bind(job.max_retries as i64)
        .bind(job.retry_backoff_base_seconds)
        .bind(job.next_run_at.map(|t| t.to_rfc3339()))
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(&job.lock_token)
        .bind(job.lock_acquired_at.map(|t| t.to_rfc3339()))
        .bind(&job.last_error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Acquires the lease lock with a single conditional UPDATE: the row only
    /// changes if `lock_token IS NULL` or the previous holder's lease has
    /// expired, so concurrent replicas racing on the same job can never both
    /// believe they won (§3 invariant 1, §4.7).
    async fn acquire_lock(
        &self,
        job_id: &str,
        token: &str,
        now: DateTime<Utc>,
        lease: ChronoDuration,
    ) -> Result<bool> {
        let cutoff = now - lease;
        let result = sqlx::query(
            "UPDATE jobs SET lock_token = ?, lock_acquired_at = ? WHERE id = ? AND (lock_token IS NULL OR lock_acquired_at <= ?)",
        )
        .bind(token)
        .bind(now.to_rfc3339())
        .bind(job_id)
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, job_id: &str, token: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET lock_token = NULL, lock_acquired_at = NULL WHERE id = ? AND lock_token = ?",
        )
        .bind(job_id)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear_stale_locks(&self, lease_expired_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET lock_token = NULL, lock_acquired_at = NULL WHERE lock_acquired_at < ?",
        )
        .bind(lease_expired_before.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_executions (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                execution_number INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER,
                retry_attempt INTEGER NOT NULL,
                items_crawled INTEGER NOT NULL,
                items_indexed INTEGER NOT NULL,
                error TEXT,
                metadata TEXT,
                log_object_key TEXT,
                log_size_bytes INTEGER,
                log_line_count INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("failed to create executions table: {e}")))?;
        Ok(())
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<JobExecution> {
        let status_str: String = row.try_get("status").map_err(db_err)?;
        let metadata_str: Option<String> = row.try_get("metadata").map_err(db_err)?;
        Ok(JobExecution {
            id: row.try_get("id").map_err(db_err)?,
            job_id: row.try_get("job_id").map_err(db_err)?,
            execution_number: row.try_get::<i64, _>("execution_number").map_err(db_err)? as u64,
            status: parse_execution_status(&status_str)?,
            started_at: row.try_get("started_at").map_err(db_err)?,
            completed_at: row.try_get("completed_at").map_err(db_err)?,
            duration_ms: row
                .try_get::<Option<i64>, _>("duration_ms")
                .map_err(db_err)?
                .map(|v| v as u64),
            retry_attempt: row.try_get::<i64, _>("retry_attempt").map_err(db_err)? as u32,
            items_crawled: row.try_get::<i64, _>("items_crawled").map_err(db_err)? as u64,
            items_indexed: row.try_get::<i64, _>("items_indexed").map_err(db_err)? as u64,
            error: row.try_get("error").map_err(db_err)?,
            metadata: metadata_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null),
            log_object_key: row.try_get("log_object_key").map_err(db_err)?,
            log_size_bytes: row
                .try_get::<Option<i64>, _>("log_size_bytes")
                .map_err(db_err)?
                .map(|v| v as u64),
            log_line_count: row
                .try_get::<Option<i64>, _>("log_line_count")
                .map_err(db_err)?
                .map(|v| v as u64),
        })
    }
}

fn parse_execution_status(s: &str) -> Result<ExecutionStatus> {
    match s {
        "running" => Ok(ExecutionStatus::Running),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        other => Err(Error::Database(format!("invalid execution status {other}"))),
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create(&self, execution: &JobExecution) -> Result<()> {
        self.update(execution).await
    }

    async fn update(&self, execution: &JobExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_executions (
                id, job_id, execution_number, status, started_at, completed_at, duration_ms,
                retry_attempt, items_crawled, items_indexed, error, metadata,
                log_object_key, log_size_bytes, log_line_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                duration_ms = excluded.duration_ms,
                items_crawled = excluded.items_crawled,
                items_indexed = excluded.items_indexed,
                error = excluded.error,
                metadata = excluded.metadata,
                log_object_key = excluded.log_object_key,
                log_size_bytes = excluded.log_size_bytes,
                log_line_count = excluded.log_line_count
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.job_id)
        .bind(execution.execution_number as i64)
        .bind(status_str(execution.status))
        .bind(execution.started_at.to_rfc3339())
        .bind(execution.completed_at.map(|t| t.to_rfc3339()))
        .bind(execution.duration_ms.map(|v| v as i64))
        .bind(execution.retry_attempt as i64)
        .bind(execution.items_crawled as i64)
        .bind(execution.items_indexed as i64)
        .bind(&execution.error)
        .bind(serde_json::to_string(&execution.metadata).unwrap_or_default())
        .bind(&execution.log_object_key)
        .bind(execution.log_size_bytes.map(|v| v as i64))
        .bind(execution.log_line_count.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<JobExecution>> {
        let row = sqlx::query("SELECT * FROM job_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn count_by_job_id(&self, job_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_executions WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn get_latest_by_job_id(&self, job_id: &str) -> Result<Option<JobExecution>> {
        let row = sqlx::query(
            "SELECT * FROM job_executions WHERE job_id = ? ORDER BY execution_number DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn get_orphaned_running_jobs(&self) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query("SELECT * FROM job_executions WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn get_stuck_jobs(&self, running_longer_than: DateTime<Utc>) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM job_executions WHERE status = 'running' AND started_at < ?",
        )
        .bind(running_longer_than.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn get_aggregate_stats(&self) -> Result<AggregateStats> {
        let avg_duration_ms: Option<f64> =
            sqlx::query_scalar("SELECT AVG(duration_ms) FROM job_executions WHERE duration_ms IS NOT NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_executions")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let completed: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_executions WHERE status = 'completed'")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        let active_jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE lock_token IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .unwrap_or(0);
        let scheduled_jobs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'scheduled'")
                .fetch_one(&self.pool)
                .await
                .unwrap_or(0);

        Ok(AggregateStats {
            avg_duration_ms,
            success_rate: if total > 0 {
                completed as f64 / total as f64
            } else {
                0.0
            },
            active_jobs: active_jobs as u64,
            scheduled_jobs: scheduled_jobs as u64,
        })
    }
}

fn status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Job;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite pool")
    }

    #[tokio::test]
    async fn acquire_lock_is_exclusive_across_racing_callers() {
        let pool = memory_pool().await;
        let store = SqliteJobStore::new(pool);
        store.migrate().await.unwrap();

        let mut job = Job::new("source-1".into(), "https://example.com".into());
        job.status = JobStatus::Scheduled;
        store.update(&job).await.unwrap();

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
    async fn release_lock_only_clears_matching_token() {
        let pool = memory_pool().await;
        let store = SqliteJobStore::new(pool);
        store.migrate().await.unwrap();

        let mut job = Job::new("source-1".into(), "https://example.com".into());
        job.status = JobStatus::Scheduled;
        store.update(&job).await.unwrap();

        let now = Utc::now();
        let lease = ChronoDuration::seconds(300);
        store
            .acquire_lock(&job.id, "token-a", now, lease)
            .await
            .unwrap();
        store.release_lock(&job.id, "wrong-token").await.unwrap();
        assert!(!store
            .acquire_lock(&job.id, "token-b", now, lease)
            .await
            .unwrap());

        store.release_lock(&job.id, "token-a").await.unwrap();
        assert!(store
            .acquire_lock(&job.id, "token-b", now, lease)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn acquire_lock_reclaims_once_lease_expires() {
        let pool = memory_pool().await;
        let store = SqliteJobStore::new(pool);
        store.migrate().await.unwrap();

        let mut job = Job::new("source-1".into(), "https://example.com".into());
        job.status = JobStatus::Scheduled;
        store.update(&job).await.unwrap();

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
}
