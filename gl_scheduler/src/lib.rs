//! ABOUTME: Recurring-job coordination core for distributed crawl scheduling
//! ABOUTME: Lease-lock claiming, adaptive rescheduling, and per-execution log capture

pub mod bucket_map;
pub mod collaborators;
pub mod inmemory;
pub mod job_logger;
pub mod log_buffer;
pub mod log_capture;
pub mod metrics;
pub mod rate_limiter;
pub mod scheduler;
pub mod settings;
pub mod state_machine;
pub mod types;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteExecutionStore, SqliteJobStore};

pub use bucket_map::BucketMap;
pub use collaborators::{
    ContentHashTracker, Crawler, CrawlerFactory, DisabledLogArchiver, ExecutionStore, JobStore,
    LivePublisher, LogArchiver, NoopLivePublisher,
};
pub use job_logger::{JobLogger, JobLogging, NoopJobLogger, Verbosity, MAX_LOGS};
pub use log_buffer::CircularLogBuffer;
pub use log_capture::{LogCaptureService, LogWriter};
pub use metrics::MetricsAggregator;
pub use rate_limiter::RateLimiter;
pub use scheduler::IntervalSchedulerCore;
pub use settings::SchedulerSettings;
pub use state_machine::{can_cancel, can_pause, can_resume, can_retry, can_transition, validate_transition, JobStatus};
pub use types::{
    AggregateStats, ExecutionStatus, ExtractionQuality, IntervalUnit, Job, JobExecution, JobSummary,
    LogCategory, LogEntry, LogLevel, ResponseTimeStats, SkipReasons, TopError, LOG_SCHEMA_VERSION,
};
