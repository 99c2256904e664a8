//! ABOUTME: Lock-free per-execution metrics aggregator
//! ABOUTME: Atomic counters and concurrent histograms, snapshotted into a JobSummary

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::types::{
    ExtractionQuality, JobSummary, ResponseTimeStats, SkipReasons, TopError,
};

const TOP_K: usize = 5;

/// Sentinel stored in `min_response_ms` before any response is recorded (§4.2).
const MIN_UNSET: i64 = -1;

#[derive(Default)]
struct TopErrorRecord {
    count: AtomicU64,
    last_url: RwLock<Option<String>>,
}

/// Accumulates the quantitative signals for one job execution. Every counter
/// is monotone and lock-free except the histograms, which take a brief read
/// lock to scan (§4.2, §9).
pub struct MetricsAggregator {
    pages_discovered: AtomicU64,
    pages_crawled: AtomicU64,
    items_extracted: AtomicU64,
    errors: AtomicU64,
    bytes_fetched: AtomicU64,
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    queue_depth: AtomicU64,
    logs_emitted: AtomicU64,
    logs_throttled: AtomicU64,
    cloudflare_blocks: AtomicU64,
    rate_limits: AtomicU64,

    response_time_sum_ms: AtomicU64,
    response_time_count: AtomicU64,
    response_time_min_ms: AtomicI64,
    response_time_max_ms: AtomicI64,

    skip_non_html: AtomicU64,
    skip_max_depth: AtomicU64,
    skip_robots_txt: AtomicU64,

    items_indexed: AtomicU64,
    empty_title_count: AtomicU64,
    empty_body_count: AtomicU64,

    status_codes: RwLock<HashMap<u16, AtomicU64>>,
    error_categories: RwLock<HashMap<String, AtomicU64>>,
    top_errors: RwLock<HashMap<String, TopErrorRecord>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            pages_discovered: AtomicU64::new(0),
            pages_crawled: AtomicU64::new(0),
            items_extracted: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            logs_emitted: AtomicU64::new(0),
            logs_throttled: AtomicU64::new(0),
            cloudflare_blocks: AtomicU64::new(0),
            rate_limits: AtomicU64::new(0),
            response_time_sum_ms: AtomicU64::new(0),
            response_time_count: AtomicU64::new(0),
            response_time_min_ms: AtomicI64::new(MIN_UNSET),
            response_time_max_ms: AtomicI64::new(0),
            skip_non_html: AtomicU64::new(0),
            skip_max_depth: AtomicU64::new(0),
            skip_robots_txt: AtomicU64::new(0),
            items_indexed: AtomicU64::new(0),
            empty_title_count: AtomicU64::new(0),
            empty_body_count: AtomicU64::new(0),
            status_codes: RwLock::new(HashMap::new()),
            error_categories: RwLock::new(HashMap::new()),
            top_errors: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_page_discovered(&self) {
        self.pages_discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_crawled(&self) {
        self.pages_crawled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_extracted(&self) {
        self.items_extracted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, status_code: u16, duration_ms: u64, bytes: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
        self.record_status_code(status_code);
        self.record_response_time(duration_ms);
    }

    pub fn record_request_failed(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status_code(&self, status_code: u16) {
        {
            let codes = self.status_codes.read().expect("status codes lock poisoned");
            if let Some(counter) = codes.get(&status_code) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut codes = self.status_codes.write().expect("status codes lock poisoned");
        codes
            .entry(status_code)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_time(&self, duration_ms: u64) {
        self.response_time_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.response_time_count.fetch_add(1, Ordering::Relaxed);

        let ms = duration_ms as i64;
        let mut current = self.response_time_min_ms.load(Ordering::Relaxed);
        loop {
            if current != MIN_UNSET && current <= ms {
                break;
            }
            match self.response_time_min_ms.compare_exchange_weak(
                current,
                ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let mut current = self.response_time_max_ms.load(Ordering::Relaxed);
        loop {
            if current >= ms {
                break;
            }
            match self.response_time_max_ms.compare_exchange_weak(
                current,
                ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn record_cloudflare_block(&self) {
        self.cloudflare_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit(&self) {
        self.rate_limits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip_non_html(&self) {
        self.skip_non_html.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip_max_depth(&self) {
        self.skip_max_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip_robots_txt(&self) {
        self.skip_robots_txt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_indexed(&self, empty_title: bool, empty_body: bool) {
        self.items_indexed.fetch_add(1, Ordering::Relaxed);
        if empty_title {
            self.empty_title_count.fetch_add(1, Ordering::Relaxed);
        }
        if empty_body {
            self.empty_body_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn record_log_emitted(&self) {
        self.logs_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_log_throttled(&self) {
        self.logs_throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a crawl error under `category`, deduplicated by `message`
    /// into the top-K tracker with the most recent offending URL (§4.2).
    pub fn record_error(&self, category: &str, message: &str, url: Option<&str>) {
        self.errors.fetch_add(1, Ordering::Relaxed);

        {
            let categories = self
                .error_categories
                .read()
                .expect("error categories lock poisoned");
            if let Some(counter) = categories.get(category) {
                counter.fetch_add(1, Ordering::Relaxed);
            } else {
                drop(categories);
                let mut categories = self
                    .error_categories
                    .write()
                    .expect("error categories lock poisoned");
                categories
                    .entry(category.to_string())
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let top = self.top_errors.read().expect("top errors lock poisoned");
            if let Some(record) = top.get(message) {
                record.count.fetch_add(1, Ordering::Relaxed);
                if let Some(url) = url {
                    *record.last_url.write().expect("last url lock poisoned") =
                        Some(url.to_string());
                }
                return;
            }
        }
        let mut top = self.top_errors.write().expect("top errors lock poisoned");
        let record = top.entry(message.to_string()).or_default();
        record.count.fetch_add(1, Ordering::Relaxed);
        if let Some(url) = url {
            *record.last_url.write().expect("last url lock poisoned") = Some(url.to_string());
        }
    }

    /// Snapshots every counter once and assembles a `JobSummary`. Fields are
    /// read independently; no cross-field atomicity is claimed beyond the
    /// throttle percentage, which is derived from the two values read here
    /// (§4.2).
    pub fn build_summary(&self) -> JobSummary {
        let logs_emitted = self.logs_emitted.load(Ordering::Relaxed);
        let logs_throttled = self.logs_throttled.load(Ordering::Relaxed);
        let throttle_percent = if logs_emitted + logs_throttled > 0 {
            (logs_throttled as f64 / (logs_emitted + logs_throttled) as f64) * 100.0
        } else {
            0.0
        };

        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let response_time = if requests_total > 0 {
            let count = self.response_time_count.load(Ordering::Relaxed).max(1);
            let sum = self.response_time_sum_ms.load(Ordering::Relaxed);
            let min_raw = self.response_time_min_ms.load(Ordering::Relaxed);
            Some(ResponseTimeStats {
                avg_ms: sum as f64 / count as f64,
                min_ms: if min_raw == MIN_UNSET { 0 } else { min_raw as u64 },
                max_ms: self.response_time_max_ms.load(Ordering::Relaxed) as u64,
            })
        } else {
            None
        };

        let status_codes: HashMap<u16, u64> = self
            .status_codes
            .read()
            .expect("status codes lock poisoned")
            .iter()
            .map(|(code, counter)| (*code, counter.load(Ordering::Relaxed)))
            .collect();

        let error_categories: HashMap<String, u64> = self
            .error_categories
            .read()
            .expect("error categories lock poisoned")
            .iter()
            .map(|(category, counter)| (category.clone(), counter.load(Ordering::Relaxed)))
            .collect();

        let mut top_errors: Vec<TopError> = self
            .top_errors
            .read()
            .expect("top errors lock poisoned")
            .iter()
            .map(|(message, record)| TopError {
                message: message.clone(),
                count: record.count.load(Ordering::Relaxed),
                last_url: record.last_url.read().expect("last url lock poisoned").clone(),
            })
            .collect();
        top_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
        top_errors.truncate(TOP_K);

        JobSummary {
            pages_discovered: self.pages_discovered.load(Ordering::Relaxed),
            pages_crawled: self.pages_crawled.load(Ordering::Relaxed),
            items_extracted: self.items_extracted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            requests_total,
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            status_codes,
            top_errors,
            logs_emitted,
            logs_throttled,
            throttle_percent,
            cloudflare_blocks: self.cloudflare_blocks.load(Ordering::Relaxed),
            rate_limits: self.rate_limits.load(Ordering::Relaxed),
            response_time,
            skipped: SkipReasons {
                non_html: self.skip_non_html.load(Ordering::Relaxed),
                max_depth: self.skip_max_depth.load(Ordering::Relaxed),
                robots_txt: self.skip_robots_txt.load(Ordering::Relaxed),
            },
            error_categories,
            extraction_quality: ExtractionQuality {
                items_indexed: self.items_indexed.load(Ordering::Relaxed),
                empty_title_count: self.empty_title_count.load(Ordering::Relaxed),
                empty_body_count: self.empty_body_count.load(Ordering::Relaxed),
            },
        }
    }
}
