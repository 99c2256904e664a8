//! ABOUTME: Per-execution structured logger bridging crawl activity into the log buffer
//! ABOUTME: Verbosity gating, debug-rate throttling, and a 15s heartbeat while running

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::log_buffer::CircularLogBuffer;
use crate::metrics::MetricsAggregator;
use crate::rate_limiter::RateLimiter;
use crate::types::{JobSummary, LogCategory, LogEntry, LogLevel, LOG_SCHEMA_VERSION};

/// Caps the number of entries a single execution may write into its buffer,
/// independent of the buffer's own ring capacity (§4.4).
pub const MAX_LOGS: u64 = 50_000;

/// How noisy a `JobLogger` is. Ordered so that "is this level enabled"
/// reduces to `self.verbosity >= required` (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Normal,
    Debug,
    Trace,
}

/// The logging surface a crawler is handed for one execution (§6).
#[async_trait]
pub trait JobLogging: Send + Sync {
    fn info(&self, category: LogCategory, message: &str);
    fn warn(&self, category: LogCategory, message: &str);
    fn error(&self, category: LogCategory, message: &str);
    fn debug(&self, category: LogCategory, message: &str);
    fn is_debug_enabled(&self) -> bool;
    fn is_trace_enabled(&self) -> bool;
    fn flush(&self);
}

/// Discards everything. Used where a collaborator wants a logger but the
/// caller doesn't care to capture anything (e.g. orphan recovery probes).
pub struct NoopJobLogger;

impl JobLogging for NoopJobLogger {
    fn info(&self, _category: LogCategory, _message: &str) {}
    fn warn(&self, _category: LogCategory, _message: &str) {}
    fn error(&self, _category: LogCategory, _message: &str) {}
    fn debug(&self, _category: LogCategory, _message: &str) {}
    fn is_debug_enabled(&self) -> bool {
        false
    }
    fn is_trace_enabled(&self) -> bool {
        false
    }
    fn flush(&self) {}
}

/// Logs one execution's activity into its `CircularLogBuffer`, mirrors to
/// `tracing`, and updates the shared `MetricsAggregator`. Cloning shares the
/// same buffer, metrics, and `MAX_LOGS` counter; `with_fields` instead
/// produces a child with a flattened, precomputed field map so nested
/// contexts don't pay a parent-chain walk on every call (§4.4).
#[derive(Clone)]
pub struct JobLogger {
    job_id: String,
    execution_id: String,
    verbosity: Verbosity,
    buffer: Arc<CircularLogBuffer>,
    metrics: Arc<MetricsAggregator>,
    debug_limiter: Arc<RateLimiter>,
    written: Arc<AtomicU64>,
    fields: Option<Arc<HashMap<String, Value>>>,
}

impl JobLogger {
    pub fn new(
        job_id: String,
        execution_id: String,
        verbosity: Verbosity,
        buffer: Arc<CircularLogBuffer>,
        metrics: Arc<MetricsAggregator>,
        debug_rate_per_second: f64,
    ) -> Self {
        Self {
            job_id,
            execution_id,
            verbosity,
            buffer,
            metrics,
            debug_limiter: Arc::new(RateLimiter::new(debug_rate_per_second)),
            written: Arc::new(AtomicU64::new(0)),
            fields: None,
        }
    }

    /// A child logger with `extra` merged into (and overriding) any fields
    /// already attached to `self`. Flattened eagerly, not chained.
    pub fn with_fields(&self, extra: HashMap<String, Value>) -> Self {
        let mut merged = self
            .fields
            .as_ref()
            .map(|f| (**f).clone())
            .unwrap_or_default();
        merged.extend(extra);
        Self {
            fields: Some(Arc::new(merged)),
            ..self.clone()
        }
    }

    fn enabled(&self, level: LogLevel) -> bool {
        match level {
            LogLevel::Trace => self.verbosity >= Verbosity::Trace,
            LogLevel::Debug => self.verbosity >= Verbosity::Debug,
            _ => self.verbosity > Verbosity::Quiet,
        }
    }

    fn emit(&self, level: LogLevel, category: LogCategory, message: &str) {
        if !self.enabled(level) {
            return;
        }
        if level == LogLevel::Debug && !self.debug_limiter.allow() {
            self.metrics.record_log_throttled();
            return;
        }
        if self.written.load(Ordering::Relaxed) >= MAX_LOGS {
            // Only debug logs count toward the throttle percentage; the
            // MAX_LOGS cutoff is a separate, silent cap on every level (§4.4).
            if level == LogLevel::Debug {
                self.metrics.record_log_throttled();
            }
            return;
        }

        let entry = LogEntry {
            schema_version: LOG_SCHEMA_VERSION,
            timestamp: Utc::now(),
            level,
            category,
            message: message.to_string(),
            job_id: self.job_id.clone(),
            execution_id: self.execution_id.clone(),
            fields: self.fields.as_ref().map(|f| (**f).clone()),
        };

        match level {
            LogLevel::Error => tracing::error!(job_id = %self.job_id, execution_id = %self.execution_id, %message),
            LogLevel::Warn => tracing::warn!(job_id = %self.job_id, execution_id = %self.execution_id, %message),
            LogLevel::Debug => tracing::debug!(job_id = %self.job_id, execution_id = %self.execution_id, %message),
            LogLevel::Trace => tracing::trace!(job_id = %self.job_id, execution_id = %self.execution_id, %message),
            LogLevel::Info => tracing::info!(job_id = %self.job_id, execution_id = %self.execution_id, %message),
        }

        self.buffer.write(entry);
        self.written.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_log_emitted();
    }

    pub fn job_started(&self) {
        self.emit(LogLevel::Info, LogCategory::Lifecycle, "job started");
    }

    pub fn job_completed(&self, summary: &JobSummary) {
        self.emit(
            LogLevel::Info,
            LogCategory::Lifecycle,
            &format!(
                "job completed: {} pages crawled, {} errors",
                summary.pages_crawled, summary.errors
            ),
        );
    }

    pub fn job_failed(&self, error: &str) {
        self.emit(
            LogLevel::Error,
            LogCategory::Lifecycle,
            &format!("job failed: {error}"),
        );
    }

    /// Emits a heartbeat roughly every 15 seconds until `ctx` is cancelled or
    /// the execution completes (§4.4). Runs as an independent task spawned
    /// by the scheduler core alongside the crawler future.
    pub async fn run_heartbeat(&self, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    self.emit(LogLevel::Debug, LogCategory::Lifecycle, "heartbeat");
                }
            }
        }
    }

    pub fn build_summary(&self) -> JobSummary {
        self.metrics.build_summary()
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn buffer(&self) -> &Arc<CircularLogBuffer> {
        &self.buffer
    }
}

#[async_trait]
impl JobLogging for JobLogger {
    fn info(&self, category: LogCategory, message: &str) {
        self.emit(LogLevel::Info, category, message);
    }

    fn warn(&self, category: LogCategory, message: &str) {
        self.emit(LogLevel::Warn, category, message);
    }

    fn error(&self, category: LogCategory, message: &str) {
        self.emit(LogLevel::Error, category, message);
    }

    fn debug(&self, category: LogCategory, message: &str) {
        self.emit(LogLevel::Debug, category, message);
    }

    fn is_debug_enabled(&self) -> bool {
        self.verbosity >= Verbosity::Debug
    }

    fn is_trace_enabled(&self) -> bool {
        self.verbosity >= Verbosity::Trace
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(verbosity: Verbosity) -> JobLogger {
        JobLogger::new(
            "job-1".into(),
            "exec-1".into(),
            verbosity,
            Arc::new(CircularLogBuffer::new(100)),
            Arc::new(MetricsAggregator::new()),
            1_000.0,
        )
    }

    #[test]
    fn quiet_suppresses_info_and_above() {
        let logger = logger(Verbosity::Quiet);
        logger.info(LogCategory::Lifecycle, "hello");
        assert_eq!(logger.buffer().len(), 0);
    }

    #[test]
    fn normal_allows_info_but_not_debug() {
        let logger = logger(Verbosity::Normal);
        logger.info(LogCategory::Lifecycle, "hello");
        logger.debug(LogCategory::Lifecycle, "verbose");
        assert_eq!(logger.buffer().len(), 1);
        assert!(!logger.is_debug_enabled());
    }

    #[test]
    fn debug_level_enables_debug_but_not_trace() {
        let logger = logger(Verbosity::Debug);
        assert!(logger.is_debug_enabled());
        assert!(!logger.is_trace_enabled());
    }

    #[test]
    fn with_fields_flattens_and_overrides() {
        let base = logger(Verbosity::Normal);
        let mut first = HashMap::new();
        first.insert("url".to_string(), Value::String("https://a".into()));
        let child = base.with_fields(first);

        let mut second = HashMap::new();
        second.insert("url".to_string(), Value::String("https://b".into()));
        second.insert("depth".to_string(), Value::from(2));
        let grandchild = child.with_fields(second);

        grandchild.info(LogCategory::Fetch, "fetched");
        let entries = grandchild.buffer().read_all();
        let fields = entries[0].fields.as_ref().unwrap();
        assert_eq!(fields.get("url"), Some(&Value::String("https://b".into())));
        assert_eq!(fields.get("depth"), Some(&Value::from(2)));
    }

    #[test]
    fn max_logs_cap_is_shared_across_clones() {
        let logger = logger(Verbosity::Trace);
        let clone = logger.clone();
        for _ in 0..10 {
            logger.info(LogCategory::Lifecycle, "a");
            clone.info(LogCategory::Lifecycle, "b");
        }
        assert_eq!(logger.written.load(Ordering::Relaxed), 20);
        assert_eq!(clone.written.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn max_logs_cutoff_does_not_count_as_throttled_for_non_debug() {
        let logger = JobLogger::new(
            "job-1".into(),
            "exec-1".into(),
            Verbosity::Normal,
            Arc::new(CircularLogBuffer::new(100)),
            Arc::new(MetricsAggregator::new()),
            1_000.0,
        );
        logger.written.store(MAX_LOGS, Ordering::Relaxed);
        logger.info(LogCategory::Lifecycle, "past the cap");
        assert_eq!(logger.build_summary().logs_throttled, 0);
    }
}
