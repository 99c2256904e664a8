//! ABOUTME: Per-execution log capture: ingestion, buffering, and gzip archival
//! ABOUTME: Parses a crawler's raw NDJSON log output and forwards lines live

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use gl_core::{Error, Result};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::collaborators::{ArchiveTask, LivePublisher, LogArchiver};
use crate::log_buffer::CircularLogBuffer;
use crate::types::{LogCategory, LogEntry, LogLevel, LOG_SCHEMA_VERSION};

/// Parses raw log lines (as a crawler subprocess or task might emit them)
/// into `LogEntry` values and writes them into a buffer, forwarding each
/// line to the live publisher as it arrives (§4.5).
pub struct LogWriter {
    job_id: String,
    execution_id: String,
    buffer: Arc<CircularLogBuffer>,
    publisher: Arc<dyn LivePublisher>,
    min_level: LogLevel,
}

impl LogWriter {
    pub fn new(
        job_id: String,
        execution_id: String,
        buffer: Arc<CircularLogBuffer>,
        publisher: Arc<dyn LivePublisher>,
    ) -> Self {
        Self {
            job_id,
            execution_id,
            buffer,
            publisher,
            min_level: LogLevel::Info,
        }
    }

    pub fn with_min_level(mut self, min_level: LogLevel) -> Self {
        self.min_level = min_level;
        self
    }

    /// Ingests one raw line. Unparseable input becomes a single `info` entry
    /// carrying the raw text verbatim rather than being dropped (§4.5).
    pub async fn write_line(&self, raw: &str) {
        let entry = self.parse_line(raw);
        if entry.level < self.min_level {
            return;
        }
        self.publisher
            .publish_log_line(&self.job_id, &self.execution_id, raw)
            .await;
        self.buffer.write(entry);
    }

    fn parse_line(&self, raw: &str) -> LogEntry {
        let trimmed = raw.trim();
        let parsed: Option<Value> = serde_json::from_str(trimmed).ok();

        let (level, message, fields) = match parsed {
            Some(Value::Object(mut map)) => {
                let level = map
                    .remove("level")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .and_then(|s| level_from_str(&s))
                    .unwrap_or(LogLevel::Info);
                let message = map
                    .remove("msg")
                    .or_else(|| map.remove("message"))
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| trimmed.to_string());
                map.remove("ts");
                map.remove("time");
                let fields: HashMap<String, Value> = map.into_iter().collect();
                let fields = if fields.is_empty() { None } else { Some(fields) };
                (level, message, fields)
            }
            _ => (LogLevel::Info, trimmed.to_string(), None),
        };

        LogEntry {
            schema_version: LOG_SCHEMA_VERSION,
            timestamp: chrono::Utc::now(),
            level,
            category: LogCategory::Fetch,
            message,
            job_id: self.job_id.clone(),
            execution_id: self.execution_id.clone(),
            fields,
        }
    }
}

fn level_from_str(s: &str) -> Option<LogLevel> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(LogLevel::Trace),
        "debug" => Some(LogLevel::Debug),
        "info" => Some(LogLevel::Info),
        "warn" | "warning" => Some(LogLevel::Warn),
        "error" => Some(LogLevel::Error),
        _ => None,
    }
}

struct CaptureState {
    buffer: Arc<CircularLogBuffer>,
    job_id: String,
    execution_number: u64,
    started_at: DateTime<Utc>,
    closed: bool,
}

/// Owns the lifecycle of one execution's log capture: opening a buffer,
/// accepting writes, and closing out with a (best-effort) gzip archive
/// handoff to the `LogArchiver` (§4.5).
pub struct LogCaptureService {
    archiver: Arc<dyn LogArchiver>,
    publisher: Arc<dyn LivePublisher>,
    buffer_capacity: usize,
    captures: Mutex<HashMap<String, CaptureState>>,
}

impl LogCaptureService {
    pub fn new(
        archiver: Arc<dyn LogArchiver>,
        publisher: Arc<dyn LivePublisher>,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            archiver,
            publisher,
            buffer_capacity,
            captures: Mutex::new(HashMap::new()),
        }
    }

    /// Begins capturing for `execution_id`, returning the buffer so a
    /// `JobLogger` can be built against it. Fails if a capture is already
    /// active for that execution id (§4.5 `StartCapture(jobId, execId,
    /// execNumber)`); every execution id is freshly generated, so this only
    /// fires if the caller tries to start the same execution twice.
    pub async fn start_capture(
        &self,
        job_id: &str,
        execution_id: &str,
        execution_number: u64,
    ) -> Result<Arc<CircularLogBuffer>> {
        let mut captures = self.captures.lock().await;
        if captures.contains_key(execution_id) {
            return Err(Error::Validation(format!(
                "log capture already active for execution {execution_id}"
            )));
        }
        let buffer = Arc::new(CircularLogBuffer::new(self.buffer_capacity));
        captures.insert(
            execution_id.to_string(),
            CaptureState {
                buffer: buffer.clone(),
                job_id: job_id.to_string(),
                execution_number,
                started_at: Utc::now(),
                closed: false,
            },
        );
        Ok(buffer)
    }

    pub async fn is_capturing(&self, execution_id: &str) -> bool {
        self.captures
            .lock()
            .await
            .get(execution_id)
            .map(|s| !s.closed)
            .unwrap_or(false)
    }

    /// Closes the capture for `execution_id`, gzips its buffered lines, and
    /// hands them to the archiver. Idempotent: calling twice is a no-op the
    /// second time. Archive failures are logged and swallowed, never
    /// propagated, since losing logs must not fail an otherwise-successful
    /// execution (§4.5, §7).
    pub async fn stop_capture(&self, execution_id: &str) -> Option<(String, u64, u64)> {
        let mut captures = self.captures.lock().await;
        let state = captures.get_mut(execution_id)?;
        if state.closed {
            return None;
        }
        state.closed = true;
        let buffer = state.buffer.clone();
        let job_id = state.job_id.clone();
        let execution_number = state.execution_number;
        let started_at = state.started_at;
        drop(captures);

        let raw = buffer.bytes();
        let size_bytes = raw.len() as u64;
        let line_count = buffer.line_count();

        let gzipped = match gzip(&raw) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(job_id, execution_id, error = %err, "failed to gzip execution log");
                return Some((String::new(), size_bytes, line_count));
            }
        };

        let task = ArchiveTask {
            job_id: job_id.clone(),
            execution_id: execution_id.to_string(),
            execution_number,
            gzipped_bytes: gzipped,
            line_count,
            started_at,
        };

        match self.archiver.archive(task).await {
            Ok(object_key) if !object_key.is_empty() => {
                self.publisher
                    .publish_log_archived(&job_id, execution_id, &object_key)
                    .await;
                Some((object_key, size_bytes, line_count))
            }
            Ok(_) => Some((String::new(), size_bytes, line_count)),
            Err(err) => {
                tracing::warn!(job_id, execution_id, error = %err, "log archival failed, continuing without it");
                Some((String::new(), size_bytes, line_count))
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.archiver.close().await
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NoopLivePublisher;
    use flate2::read::GzDecoder;
    use std::io::Read as _;

    struct RecordingArchiver {
        archived: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl LogArchiver for RecordingArchiver {
        async fn archive(&self, task: ArchiveTask) -> Result<String> {
            let object_key = format!("logs/{}/{}.log.gz", task.job_id, task.execution_number);
            self.archived
                .lock()
                .await
                .push((object_key.clone(), task.gzipped_bytes));
            Ok(object_key)
        }

        async fn get_object(&self, _object_key: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn parses_json_lines_with_msg_and_ts_fallbacks() {
        let writer = LogWriter::new(
            "job-1".into(),
            "exec-1".into(),
            Arc::new(CircularLogBuffer::new(10)),
            Arc::new(NoopLivePublisher),
        );
        let entry = writer.parse_line(r#"{"level":"warn","message":"slow response","ts":"2024-01-01T00:00:00Z","url":"https://a"}"#);
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.message, "slow response");
        assert!(entry.fields.unwrap().contains_key("url"));
    }

    #[test]
    fn unparseable_line_becomes_raw_info_entry() {
        let writer = LogWriter::new(
            "job-1".into(),
            "exec-1".into(),
            Arc::new(CircularLogBuffer::new(10)),
            Arc::new(NoopLivePublisher),
        );
        let entry = writer.parse_line("not json at all");
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.message, "not json at all");
    }

    #[tokio::test]
    async fn stop_capture_is_idempotent_and_gzips_content() {
        let archiver = Arc::new(RecordingArchiver {
            archived: Mutex::new(Vec::new()),
        });
        let service = LogCaptureService::new(archiver.clone(), Arc::new(NoopLivePublisher), 100);

        let buffer = service.start_capture("job-1", "exec-1", 1).await.unwrap();
        let writer = LogWriter::new(
            "job-1".into(),
            "exec-1".into(),
            buffer,
            Arc::new(NoopLivePublisher),
        );
        writer.write_line(r#"{"level":"info","message":"hello"}"#).await;

        let first = service.stop_capture("exec-1").await;
        assert!(first.is_some());
        assert_eq!(first.unwrap().0, "logs/job-1/1.log.gz");
        let second = service.stop_capture("exec-1").await;
        assert!(second.is_none());

        let archived = archiver.archived.lock().await;
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].0, "logs/job-1/1.log.gz");
        let mut decoder = GzDecoder::new(archived[0].1.as_slice());
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert!(decompressed.contains("hello"));
    }

    #[tokio::test]
    async fn start_capture_rejects_duplicate_execution_id() {
        let archiver = Arc::new(RecordingArchiver {
            archived: Mutex::new(Vec::new()),
        });
        let service = LogCaptureService::new(archiver, Arc::new(NoopLivePublisher), 100);

        service.start_capture("job-1", "exec-1", 1).await.unwrap();
        assert!(service.start_capture("job-1", "exec-1", 1).await.is_err());
    }
}
