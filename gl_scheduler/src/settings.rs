//! ABOUTME: Scheduler runtime configuration loaded from environment variables
//! ABOUTME: Poll cadence, lease lifetime, and the various sweep intervals

use config::{Config as ConfigBuilder, Environment};
use gl_core::{Error, Result};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Tunables for one `IntervalSchedulerCore` instance. Loaded once at startup
/// via [`SchedulerSettings::from_env`] and handed to the core by value.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct SchedulerSettings {
    /// How often the poll loop checks for jobs whose `next_run_at` has
    /// elapsed.
    #[validate(range(min = 1, max = 3600))]
    pub poll_interval_seconds: u64,

    /// Lease duration granted to a replica that acquires a job's lock.
    #[validate(range(min = 1, max = 86400))]
    pub lock_lease_seconds: i64,

    /// How often per-execution metrics are rolled up into the job's
    /// summary while it is still running.
    #[validate(range(min = 1, max = 3600))]
    pub metrics_rollup_interval_seconds: u64,

    /// How often the stale-lock sweep runs, reclaiming locks whose lease
    /// has expired without a clean release.
    #[validate(range(min = 1, max = 3600))]
    pub stale_lock_sweep_interval_seconds: u64,

    /// Maximum time an execution may remain `running` before the stuck-job
    /// sweep forces it into a terminal `failed` state.
    #[validate(range(min = 1, max = 604800))]
    pub execution_timeout_seconds: i64,

    /// How often the stuck-job sweep runs.
    #[validate(range(min = 1, max = 3600))]
    pub stuck_job_sweep_interval_seconds: u64,

    /// Debug-level log lines admitted per second per execution.
    #[validate(range(min = 0.0, max = 10000.0))]
    pub debug_log_rate_per_second: f64,

    /// Capacity of each execution's in-memory circular log buffer.
    #[validate(range(min = 1, max = 1_000_000))]
    pub log_buffer_capacity: usize,

    /// Per-execution cap on total log lines written, independent of the
    /// ring buffer's own capacity.
    #[validate(range(min = 1, max = 10_000_000))]
    pub max_logs_per_execution: u64,

    /// Whether completed executions' logs are gzipped and handed to the
    /// archiver. Disabled deployments use `DisabledLogArchiver`.
    pub archive_logs_enabled: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
            lock_lease_seconds: 300,
            metrics_rollup_interval_seconds: 30,
            stale_lock_sweep_interval_seconds: 60,
            execution_timeout_seconds: 3_600,
            stuck_job_sweep_interval_seconds: 120,
            debug_log_rate_per_second: 50.0,
            log_buffer_capacity: 10_000,
            max_logs_per_execution: 50_000,
            archive_logs_enabled: true,
        }
    }
}

impl SchedulerSettings {
    /// Loads settings from `SCHEDULER_`-prefixed environment variables,
    /// falling back to the defaults above for anything unset, then
    /// validates the result.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let builder = ConfigBuilder::builder()
            .set_default("poll_interval_seconds", defaults.poll_interval_seconds)?
            .set_default("lock_lease_seconds", defaults.lock_lease_seconds)?
            .set_default(
                "metrics_rollup_interval_seconds",
                defaults.metrics_rollup_interval_seconds,
            )?
            .set_default(
                "stale_lock_sweep_interval_seconds",
                defaults.stale_lock_sweep_interval_seconds,
            )?
            .set_default("execution_timeout_seconds", defaults.execution_timeout_seconds)?
            .set_default(
                "stuck_job_sweep_interval_seconds",
                defaults.stuck_job_sweep_interval_seconds,
            )?
            .set_default(
                "debug_log_rate_per_second",
                defaults.debug_log_rate_per_second,
            )?
            .set_default("log_buffer_capacity", defaults.log_buffer_capacity as i64)?
            .set_default(
                "max_logs_per_execution",
                defaults.max_logs_per_execution as i64,
            )?
            .set_default("archive_logs_enabled", defaults.archive_logs_enabled)?
            .add_source(
                Environment::with_prefix("SCHEDULER")
                    .try_parsing(true)
                    .separator("_"),
            );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build scheduler config: {e}")))?;

        let parsed: Self = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("failed to deserialize scheduler config: {e}")))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("scheduler config validation failed: {e}")))?;

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_load_cleanly() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::remove_var("SCHEDULER_POLL_INTERVAL_SECONDS");
        env::remove_var("SCHEDULER_LOCK_LEASE_SECONDS");

        let settings = SchedulerSettings::from_env().expect("defaults should validate");
        assert_eq!(settings.poll_interval_seconds, 10);
        assert_eq!(settings.lock_lease_seconds, 300);
        assert_eq!(settings.metrics_rollup_interval_seconds, 30);
        assert_eq!(settings.execution_timeout_seconds, 3_600);
        assert_eq!(settings.stuck_job_sweep_interval_seconds, 120);
    }

    #[test]
    fn env_override_takes_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("SCHEDULER_POLL_INTERVAL_SECONDS", "5");

        let settings = SchedulerSettings::from_env().expect("override should validate");
        assert_eq!(settings.poll_interval_seconds, 5);

        env::remove_var("SCHEDULER_POLL_INTERVAL_SECONDS");
    }

    #[test]
    fn out_of_range_value_fails_validation() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("SCHEDULER_LOCK_LEASE_SECONDS", "999999999");

        let result = SchedulerSettings::from_env();
        assert!(result.is_err());

        env::remove_var("SCHEDULER_LOCK_LEASE_SECONDS");
    }
}
