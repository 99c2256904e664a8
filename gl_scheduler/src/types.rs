//! ABOUTME: Core data types for the recurring-job coordination layer
//! ABOUTME: Job, JobExecution, JobSummary and the log entry shape they compose

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gl_core::Id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state_machine::JobStatus;

/// Unit a job's recurrence interval is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

/// The scheduled unit of work. Owned by the job store; the scheduler core
/// only mutates rows it currently holds the lease lock for (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub source_id: String,
    pub seed_url: String,
    pub status: JobStatus,
    pub interval_magnitude: u32,
    pub interval_unit: IntervalUnit,
    pub schedule_enabled: bool,
    pub adaptive_scheduling: bool,
    pub current_retry_count: u32,
    pub max_retries: u32,
    pub retry_backoff_base_seconds: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lock_token: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    /// Create a new, unscheduled job with sane defaults.
    pub fn new(source_id: String, seed_url: String) -> Self {
        Self {
            id: Id::new().to_string(),
            source_id,
            seed_url,
            status: JobStatus::Pending,
            interval_magnitude: 0,
            interval_unit: IntervalUnit::Minutes,
            schedule_enabled: false,
            adaptive_scheduling: false,
            current_retry_count: 0,
            max_retries: 3,
            retry_backoff_base_seconds: 60,
            next_run_at: None,
            started_at: None,
            completed_at: None,
            lock_token: None,
            lock_acquired_at: None,
            last_error: None,
        }
    }

    /// Whether this job recurs: it has a positive interval and is enabled for
    /// scheduling. §4.8 "Success": `interval_minutes non-null AND schedule_enabled`.
    pub fn is_recurring(&self) -> bool {
        self.interval_magnitude > 0 && self.schedule_enabled
    }

    /// The job's recurrence interval as a `chrono::Duration`.
    pub fn interval(&self) -> ChronoDuration {
        let magnitude = i64::from(self.interval_magnitude);
        match self.interval_unit {
            IntervalUnit::Minutes => ChronoDuration::minutes(magnitude),
            IntervalUnit::Hours => ChronoDuration::hours(magnitude),
            IntervalUnit::Days => ChronoDuration::days(magnitude),
        }
    }

    /// §3 invariant (1): a job is `running` iff some replica holds a
    /// non-expired lock whose token matches.
    pub fn is_locked(&self, now: DateTime<Utc>, lease: ChronoDuration) -> bool {
        match (self.lock_token.as_ref(), self.lock_acquired_at) {
            (Some(_), Some(acquired_at)) => acquired_at + lease > now,
            _ => false,
        }
    }
}

/// Status of one execution attempt. Distinct from `JobStatus` because an
/// execution never re-enters `running` once it leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// One attempt at running a job (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,
    pub execution_number: u64,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub retry_attempt: u32,
    pub items_crawled: u64,
    pub items_indexed: u64,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
    pub log_object_key: Option<String>,
    pub log_size_bytes: Option<u64>,
    pub log_line_count: Option<u64>,
}

impl JobExecution {
    pub fn new(job_id: String, execution_number: u64, retry_attempt: u32) -> Self {
        Self {
            id: Id::new().to_string(),
            job_id,
            execution_number,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            retry_attempt,
            items_crawled: 0,
            items_indexed: 0,
            error: None,
            metadata: serde_json::Value::Null,
            log_object_key: None,
            log_size_bytes: None,
            log_line_count: None,
        }
    }
}

/// Aggregate execution statistics across the whole job population (§6
/// `GetAggregateStats`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AggregateStats {
    pub avg_duration_ms: Option<f64>,
    pub success_rate: f64,
    pub active_jobs: u64,
    pub scheduled_jobs: u64,
}

/// A deduplicated top-K error record (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopError {
    pub message: String,
    pub count: u64,
    pub last_url: Option<String>,
}

/// Response-time statistics in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ResponseTimeStats {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Counts of pages skipped for each reason.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct SkipReasons {
    pub non_html: u64,
    pub max_depth: u64,
    pub robots_txt: u64,
}

/// Extraction-quality counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ExtractionQuality {
    pub items_indexed: u64,
    pub empty_title_count: u64,
    pub empty_body_count: u64,
}

/// Derived, in-memory result of one execution's metrics aggregator (§3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobSummary {
    pub pages_discovered: u64,
    pub pages_crawled: u64,
    pub items_extracted: u64,
    pub errors: u64,
    pub bytes_fetched: u64,
    pub requests_total: u64,
    pub requests_failed: u64,
    pub queue_depth: u64,
    pub status_codes: HashMap<u16, u64>,
    pub top_errors: Vec<TopError>,
    pub logs_emitted: u64,
    pub logs_throttled: u64,
    pub throttle_percent: f64,
    pub cloudflare_blocks: u64,
    pub rate_limits: u64,
    pub response_time: Option<ResponseTimeStats>,
    pub skipped: SkipReasons,
    pub error_categories: HashMap<String, u64>,
    pub extraction_quality: ExtractionQuality,
}

/// Schema version stamped on every `LogEntry` (§6).
pub const LOG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Lifecycle,
    Fetch,
    Extract,
    Error,
    RateLimit,
    Queue,
    Metrics,
}

/// A single structured log line (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    pub job_id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<HashMap<String, serde_json::Value>>,
}
