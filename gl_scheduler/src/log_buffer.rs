//! ABOUTME: Fixed-capacity in-memory ring buffer of LogEntry values
//! ABOUTME: Exports NDJSON bytes for archival without ever blocking writers on readers

use std::collections::VecDeque;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::types::LogEntry;

const DEFAULT_CAPACITY: usize = 10_000;

/// A ring of the most recent `capacity` log entries for one execution. Once
/// full, the oldest entry is dropped on write (§4.3). `line_count` tracks the
/// lifetime total and is not reset by `clear`.
pub struct CircularLogBuffer {
    capacity: usize,
    entries: RwLock<VecDeque<LogEntry>>,
    line_count: RwLock<u64>,
}

impl CircularLogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            line_count: RwLock::new(0),
        }
    }

    pub fn write(&self, entry: LogEntry) {
        let mut entries = self.entries.write().expect("log buffer lock poisoned");
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        *self.line_count.write().expect("line count lock poisoned") += 1;
    }

    pub fn read_all(&self) -> Vec<LogEntry> {
        self.entries
            .read()
            .expect("log buffer lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn read_last(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.read().expect("log buffer lock poisoned");
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn read_since(&self, since: DateTime<Utc>) -> Vec<LogEntry> {
        self.entries
            .read()
            .expect("log buffer lock poisoned")
            .iter()
            .filter(|entry| entry.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Serializes the current contents as newline-delimited JSON, one line
    /// per entry, skipping any entry that (should never, but defensively)
    /// fails to serialize rather than aborting the whole export.
    pub fn bytes(&self) -> Vec<u8> {
        let entries = self.entries.read().expect("log buffer lock poisoned");
        let mut buf = Vec::new();
        for entry in entries.iter() {
            if let Ok(line) = serde_json::to_string(entry) {
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
            }
        }
        buf
    }

    pub fn line_count(&self) -> u64 {
        *self.line_count.read().expect("line count lock poisoned")
    }

    /// Drops buffered entries but leaves `line_count` untouched.
    pub fn clear(&self) {
        self.entries.write().expect("log buffer lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("log buffer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
