//! ABOUTME: 15-minute slot load balancer preserving each job's scheduling rhythm
//! ABOUTME: Places and rebalances jobs across time buckets to spread crawl load

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use crate::state_machine::JobStatus;
use crate::types::Job;

const SLOT_SECONDS: i64 = 900;

/// Tracks which 15-minute slot each job currently occupies and how many jobs
/// share a slot, so new and rescheduled jobs can be placed into the
/// least-loaded nearby slot instead of a fixed offset (§4.6).
pub struct BucketMap {
    job_slots: RwLock<HashMap<String, DateTime<Utc>>>,
    slot_loads: RwLock<HashMap<i64, u64>>,
}

impl Default for BucketMap {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketMap {
    pub fn new() -> Self {
        Self {
            job_slots: RwLock::new(HashMap::new()),
            slot_loads: RwLock::new(HashMap::new()),
        }
    }

    /// Rounds `t` down to its 900-second slot key.
    pub fn slot_key(t: DateTime<Utc>) -> i64 {
        let epoch = t.timestamp();
        epoch - epoch.rem_euclid(SLOT_SECONDS)
    }

    pub fn slot_time(key: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(key, 0).single().expect("slot key in range")
    }

    pub fn add_job(&self, job_id: &str, run_at: DateTime<Utc>) {
        self.remove_job(job_id);
        let key = Self::slot_key(run_at);
        self.job_slots
            .write()
            .expect("job slots lock poisoned")
            .insert(job_id.to_string(), Self::slot_time(key));
        *self
            .slot_loads
            .write()
            .expect("slot loads lock poisoned")
            .entry(key)
            .or_insert(0) += 1;
    }

    pub fn remove_job(&self, job_id: &str) {
        let mut slots = self.job_slots.write().expect("job slots lock poisoned");
        if let Some(previous) = slots.remove(job_id) {
            let key = Self::slot_key(previous);
            let mut loads = self.slot_loads.write().expect("slot loads lock poisoned");
            if let Some(count) = loads.get_mut(&key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    loads.remove(&key);
                }
            }
        }
    }

    pub fn get_job_slot(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.job_slots
            .read()
            .expect("job slots lock poisoned")
            .get(job_id)
            .copied()
    }

    pub fn get_slot_load(&self, t: DateTime<Utc>) -> u64 {
        let key = Self::slot_key(t);
        *self
            .slot_loads
            .read()
            .expect("slot loads lock poisoned")
            .get(&key)
            .unwrap_or(&0)
    }

    /// Scans `[start, end]` slot-by-slot and returns the least-loaded slot's
    /// start time. Ties favor the earliest slot.
    pub fn find_least_loaded(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> DateTime<Utc> {
        let mut best_key = Self::slot_key(start);
        let mut best_load = self.get_slot_load(Self::slot_time(best_key));

        let mut key = best_key + SLOT_SECONDS;
        let end_key = Self::slot_key(end);
        while key <= end_key {
            let load = self.get_slot_load(Self::slot_time(key));
            if load < best_load {
                best_load = load;
                best_key = key;
            }
            key += SLOT_SECONDS;
        }
        Self::slot_time(best_key)
    }

    /// Places a brand-new job into the least-loaded slot within one interval
    /// of `Utc::now()`, recording the placement (§4.6).
    pub fn place_new_job(&self, job_id: &str, interval: ChronoDuration) -> DateTime<Utc> {
        let now = Utc::now();
        let horizon = now + interval.max(ChronoDuration::seconds(SLOT_SECONDS));
        let slot = self.find_least_loaded(now, horizon);
        self.add_job(job_id, slot);
        slot
    }

    /// Minimum slot load across `[start, end]`, inclusive, slot-by-slot.
    fn min_load_in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
        let start_key = Self::slot_key(start);
        let end_key = Self::slot_key(end);
        let mut min = u64::MAX;
        let mut key = start_key;
        while key <= end_key {
            min = min.min(self.get_slot_load(Self::slot_time(key)));
            key += SLOT_SECONDS;
        }
        if min == u64::MAX {
            0
        } else {
            min
        }
    }

    /// Computes the next run time for a recurring job, preserving its
    /// existing rhythm (same offset within the interval) rather than
    /// collapsing back to a fixed anchor every cycle. A job with no tracked
    /// slot is treated as brand-new (§4.7). The candidate slot is
    /// `currentSlot + ceil(interval / 15min)`; it's kept only if its load
    /// doesn't exceed the window's minimum load by more than one, otherwise
    /// the least-loaded slot in that window is used instead.
    pub fn calculate_next_run_preserve_rhythm(
        &self,
        job_id: &str,
        interval: ChronoDuration,
    ) -> DateTime<Utc> {
        let Some(previous) = self.get_job_slot(job_id) else {
            return self.place_new_job(job_id, interval);
        };

        let slots = ((interval.num_seconds().max(0) + SLOT_SECONDS - 1) / SLOT_SECONDS).max(1);
        let candidate_key = Self::slot_key(previous) + slots * SLOT_SECONDS;
        let candidate_time = Self::slot_time(candidate_key);
        let window_end = candidate_time + interval;

        let candidate_load = self.get_slot_load(candidate_time);
        let min_load = self.min_load_in_window(candidate_time, window_end);

        let chosen = if candidate_load <= min_load + 1 {
            candidate_time
        } else {
            self.find_least_loaded(candidate_time, window_end)
        };
        self.add_job(job_id, chosen);
        chosen
    }

    /// Re-places every movable job across slots, longest interval first so
    /// low-frequency jobs claim space before high-frequency ones pack around
    /// them. Jobs `can_move_job` excludes keep whatever slot they already
    /// hold. Returns the jobs that moved with their new `next_run_at`
    /// (§4.7 "Rebalance").
    pub fn rebalance(&self, jobs: &[Job]) -> Vec<(String, DateTime<Utc>)> {
        {
            let mut slots = self.job_slots.write().expect("job slots lock poisoned");
            let mut loads = self.slot_loads.write().expect("slot loads lock poisoned");
            slots.clear();
            loads.clear();
        }
        Self::rebalance_with(jobs, |job_id, interval| self.place_new_job(job_id, interval))
    }

    /// Non-writing dry run of `rebalance`: computes placements against a
    /// throwaway map so the caller can preview the effect without persisting
    /// anything (§4.7).
    pub fn preview_rebalance(jobs: &[Job]) -> Vec<(String, DateTime<Utc>)> {
        let scratch = BucketMap::new();
        Self::rebalance_with(jobs, |job_id, interval| scratch.place_new_job(job_id, interval))
    }

    fn rebalance_with<F>(jobs: &[Job], mut place: F) -> Vec<(String, DateTime<Utc>)>
    where
        F: FnMut(&str, ChronoDuration) -> DateTime<Utc>,
    {
        let mut sorted: Vec<&Job> = jobs.iter().collect();
        sorted.sort_by(|a, b| b.interval().cmp(&a.interval()));

        let mut moved = Vec::new();
        for job in sorted {
            let movable = Self::can_move_job(
                job.status.is_terminal(),
                job.status == JobStatus::Running,
                job.next_run_at.is_some(),
            );
            if !movable {
                continue;
            }
            let next = place(&job.id, job.interval());
            moved.push((job.id.clone(), next));
        }
        moved
    }

    /// Slot occupancy over the next `horizon_hours`, plus a distribution
    /// score: `1 - stddev/mean` (1.0 when `mean` is zero), 1.0 for a
    /// perfectly flat load and approaching 0 as load concentrates into a few
    /// slots (§4.7).
    pub fn get_distribution(&self, horizon_hours: i64) -> BucketDistribution {
        let now = Utc::now();
        let end = now + ChronoDuration::hours(horizon_hours);
        let start_key = Self::slot_key(now);
        let end_key = Self::slot_key(end);

        let mut loads = Vec::new();
        let mut key = start_key;
        while key <= end_key {
            loads.push(self.get_slot_load(Self::slot_time(key)));
            key += SLOT_SECONDS;
        }

        let mean = if loads.is_empty() {
            0.0
        } else {
            loads.iter().sum::<u64>() as f64 / loads.len() as f64
        };
        let variance = if loads.is_empty() {
            0.0
        } else {
            loads
                .iter()
                .map(|&l| (l as f64 - mean).powi(2))
                .sum::<f64>()
                / loads.len() as f64
        };
        let stddev = variance.sqrt();
        let score = if mean > 0.0 {
            (1.0 - stddev / mean).clamp(0.0, 1.0)
        } else {
            1.0
        };

        BucketDistribution {
            slot_count: loads.len(),
            total_jobs: loads.iter().sum(),
            mean_load: mean,
            stddev_load: stddev,
            distribution_score: score,
        }
    }

    /// A job is eligible to move during rebalancing only if it isn't
    /// currently terminal, running, or missing a `next_run_at` (§4.6).
    pub fn can_move_job(status_is_terminal: bool, status_is_running: bool, has_next_run_at: bool) -> bool {
        !status_is_terminal && !status_is_running && has_next_run_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDistribution {
    pub slot_count: usize,
    pub total_jobs: u64,
    pub mean_load: f64,
    pub stddev_load: f64,
    pub distribution_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_key_rounds_down_to_nearest_900_seconds() {
        let t = Utc.timestamp_opt(1_000_000, 0).single().unwrap();
        let key = BucketMap::slot_key(t);
        assert_eq!(key % SLOT_SECONDS, 0);
        assert!(key <= t.timestamp());
    }

    #[test]
    fn find_least_loaded_prefers_empty_slot() {
        let map = BucketMap::new();
        let now = Utc::now();
        map.add_job("a", now);
        map.add_job("b", now);

        let horizon = now + ChronoDuration::hours(1);
        let chosen = map.find_least_loaded(now, horizon);
        assert_ne!(BucketMap::slot_key(chosen), BucketMap::slot_key(now));
    }

    #[test]
    fn remove_job_decrements_slot_load() {
        let map = BucketMap::new();
        let now = Utc::now();
        map.add_job("a", now);
        map.add_job("b", now);
        assert_eq!(map.get_slot_load(now), 2);

        map.remove_job("a");
        assert_eq!(map.get_slot_load(now), 1);
    }

    #[test]
    fn preserve_rhythm_advances_by_exactly_one_interval() {
        let map = BucketMap::new();
        let now = Utc::now();
        map.add_job("a", now);
        let interval = ChronoDuration::minutes(30);
        let next = map.calculate_next_run_preserve_rhythm("a", interval);
        assert_eq!(
            BucketMap::slot_key(next),
            BucketMap::slot_key(now + interval)
        );
    }

    #[test]
    fn distribution_score_is_one_for_single_slot() {
        let map = BucketMap::new();
        let score = map.get_distribution(0).distribution_score;
        assert_eq!(score, 1.0);
    }

    #[test]
    fn can_move_job_excludes_terminal_running_and_unscheduled() {
        assert!(BucketMap::can_move_job(false, false, true));
        assert!(!BucketMap::can_move_job(true, false, true));
        assert!(!BucketMap::can_move_job(false, true, true));
        assert!(!BucketMap::can_move_job(false, false, false));
    }

    #[test]
    fn untracked_job_preserves_rhythm_as_a_new_placement() {
        let map = BucketMap::new();
        let interval = ChronoDuration::minutes(30);
        let now = Utc::now();
        let placed = map.calculate_next_run_preserve_rhythm("untracked", interval);
        assert!(placed >= now);
        assert_eq!(map.get_job_slot("untracked"), Some(placed));
    }

    #[test]
    fn preserve_rhythm_falls_back_to_least_loaded_when_candidate_is_overloaded() {
        let map = BucketMap::new();
        let now = Utc::now();
        let interval = ChronoDuration::minutes(30);
        map.add_job("a", now);

        let candidate_key = BucketMap::slot_key(now) + 2 * SLOT_SECONDS;
        let candidate_time = BucketMap::slot_time(candidate_key);
        for i in 0..5 {
            map.add_job(&format!("filler-{i}"), candidate_time);
        }

        let next = map.calculate_next_run_preserve_rhythm("a", interval);
        assert_ne!(BucketMap::slot_key(next), candidate_key);
    }

    #[test]
    fn distribution_score_penalizes_uneven_load() {
        let map = BucketMap::new();
        let now = Utc::now();
        map.add_job("a", now);
        map.add_job("b", now);
        map.add_job("c", now + ChronoDuration::hours(1));

        let distribution = map.get_distribution(2);
        assert!(distribution.distribution_score < 1.0);
        assert!(distribution.distribution_score >= 0.0);
    }

    fn sample_job(id: &str, interval_minutes: u32, status: JobStatus) -> Job {
        let mut job = Job::new(format!("source-{id}"), "https://example.com".into());
        job.id = id.to_string();
        job.interval_magnitude = interval_minutes;
        job.schedule_enabled = true;
        job.status = status;
        job.next_run_at = Some(Utc::now());
        job
    }

    #[test]
    fn rebalance_places_longer_intervals_first_and_skips_running_jobs() {
        let map = BucketMap::new();
        let running = sample_job("running", 15, JobStatus::Running);
        let short = sample_job("short", 15, JobStatus::Scheduled);
        let long = sample_job("long", 120, JobStatus::Scheduled);

        let moved = map.rebalance(&[running.clone(), short, long]);
        let moved_ids: Vec<&str> = moved.iter().map(|(id, _)| id.as_str()).collect();
        assert!(moved_ids.contains(&"long"));
        assert!(moved_ids.contains(&"short"));
        assert!(!moved_ids.contains(&"running"));
        assert_eq!(moved[0].0, "long");
    }

    #[test]
    fn preview_rebalance_does_not_mutate_any_real_map() {
        let map = BucketMap::new();
        map.add_job("existing", Utc::now());
        let job = sample_job("preview-only", 30, JobStatus::Scheduled);

        let moved = BucketMap::preview_rebalance(&[job]);
        assert_eq!(moved.len(), 1);
        assert!(map.get_job_slot("preview-only").is_none());
    }
}
