//! Engine configuration.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::cron::CronEntry;
use crate::core::error::ConfigError;
use crate::core::lifecycle::ShutdownTimeout;
use crate::core::notifier::NotifierOptions;
use crate::core::scheduler::CleanupPolicy;

use super::cron::CronEntryConfig;
use super::queues::{parse_queue_pools, QueuePool};

/// Prefix of every environment variable read by [`EngineConfig::from_env`].
pub const ENV_PREFIX: &str = "JOB_ENGINE_";

/// Root engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Queue pools, `filter:threads;filter:threads`.
    pub queues: String,
    /// Default worker count per pool.
    pub max_threads: usize,
    /// Bound on buffered future wake-ups per scheduler.
    pub max_cache: usize,
    /// Poll interval in seconds; zero or less disables polling.
    pub poll_interval_secs: f64,
    /// Use store pub/sub for low-latency wake-ups.
    pub enable_listen_notify: bool,
    /// Run the cron manager.
    pub enable_cron: bool,
    /// Back-fill window for missed cron ticks, in seconds.
    pub cron_graceful_restart_period_secs: Option<f64>,
    /// Default shutdown timeout: `None` no wait, negative forever, zero
    /// immediate, positive bounded.
    pub shutdown_timeout_secs: Option<f64>,
    /// Keep successful rows as finished instead of deleting them.
    pub preserve_job_records: bool,
    /// Age after which preserved finished rows are deleted, in seconds.
    pub cleanup_preserved_jobs_before_seconds_ago: u64,
    /// Run cleanup after this many executions; zero disables.
    pub cleanup_interval_jobs: u64,
    /// Run cleanup after this many seconds; zero disables.
    pub cleanup_interval_secs: u64,
    /// Concurrent executions allowed per concurrency key.
    pub default_concurrency_limit: usize,
    /// Per-key overrides of the concurrency limit.
    pub concurrency_limits: HashMap<String, usize>,
    /// Candidates tried per claim.
    pub claim_lookahead: usize,
    /// Longest blocking wait for one pub/sub message, in milliseconds.
    pub listen_wait_ms: u64,
    /// Pause before resubscribing, in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Cron entries by key.
    pub cron: BTreeMap<String, CronEntryConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queues: "*".to_string(),
            max_threads: 5,
            max_cache: 10_000,
            poll_interval_secs: 10.0,
            enable_listen_notify: true,
            enable_cron: false,
            cron_graceful_restart_period_secs: None,
            shutdown_timeout_secs: Some(-1.0),
            preserve_job_records: true,
            cleanup_preserved_jobs_before_seconds_ago: 14 * 24 * 60 * 60,
            cleanup_interval_jobs: 1_000,
            cleanup_interval_secs: 600,
            default_concurrency_limit: 1,
            concurrency_limits: HashMap::new(),
            claim_lookahead: 50,
            listen_wait_ms: 1_000,
            reconnect_interval_ms: 5_000,
            cron: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Validate values and parse every embedded grammar.
    ///
    /// # Errors
    ///
    /// The first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(invalid("max_threads", "must be greater than 0"));
        }
        if self.claim_lookahead == 0 {
            return Err(invalid("claim_lookahead", "must be greater than 0"));
        }
        if self.default_concurrency_limit == 0 {
            return Err(invalid("default_concurrency_limit", "must be greater than 0"));
        }
        if let Some((key, _)) = self.concurrency_limits.iter().find(|(_, max)| **max == 0) {
            return Err(invalid(
                &format!("concurrency_limits.{key}"),
                "must be greater than 0",
            ));
        }
        if self.listen_wait_ms == 0 {
            return Err(invalid("listen_wait_ms", "must be greater than 0"));
        }
        if !self.poll_interval_secs.is_finite() {
            return Err(invalid("poll_interval_secs", "must be finite"));
        }
        if self
            .cron_graceful_restart_period_secs
            .is_some_and(|secs| !secs.is_finite() || secs < 0.0)
        {
            return Err(invalid(
                "cron_graceful_restart_period_secs",
                "must be a non-negative number",
            ));
        }
        if self.shutdown_timeout_secs.is_some_and(f64::is_nan) {
            return Err(invalid("shutdown_timeout_secs", "must be a number"));
        }
        self.queue_pools()?;
        self.cron_entries()?;
        Ok(())
    }

    /// Parse configuration from JSON and validate it.
    ///
    /// # Errors
    ///
    /// Malformed JSON or any [`validate`](Self::validate) failure.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| invalid("json", &e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `.env` if present, then read `JOB_ENGINE_*` variables over the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Unparseable variables or any [`validate`](Self::validate) failure.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read `JOB_ENGINE_*` values from `lookup` over the defaults.
    ///
    /// # Errors
    ///
    /// Unparseable values or any [`validate`](Self::validate) failure.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut cfg = Self::default();

        if let Some(queues) = var("QUEUES") {
            cfg.queues = queues;
        }
        set_parsed(&mut cfg.max_threads, "MAX_THREADS", var("MAX_THREADS"))?;
        set_parsed(&mut cfg.max_cache, "MAX_CACHE", var("MAX_CACHE"))?;
        set_parsed(&mut cfg.poll_interval_secs, "POLL_INTERVAL", var("POLL_INTERVAL"))?;
        set_parsed(&mut cfg.claim_lookahead, "CLAIM_LOOKAHEAD", var("CLAIM_LOOKAHEAD"))?;
        set_parsed(
            &mut cfg.cleanup_preserved_jobs_before_seconds_ago,
            "CLEANUP_PRESERVED_JOBS_BEFORE_SECONDS_AGO",
            var("CLEANUP_PRESERVED_JOBS_BEFORE_SECONDS_AGO"),
        )?;
        if let Some(value) = var("ENABLE_LISTEN_NOTIFY") {
            cfg.enable_listen_notify = parse_bool("ENABLE_LISTEN_NOTIFY", &value)?;
        }
        if let Some(value) = var("ENABLE_CRON") {
            cfg.enable_cron = parse_bool("ENABLE_CRON", &value)?;
        }
        if let Some(value) = var("PRESERVE_JOB_RECORDS") {
            cfg.preserve_job_records = parse_bool("PRESERVE_JOB_RECORDS", &value)?;
        }
        if let Some(value) = var("SHUTDOWN_TIMEOUT") {
            cfg.shutdown_timeout_secs = parse_optional_secs("SHUTDOWN_TIMEOUT", &value)?;
        }
        if let Some(value) = var("CRON_GRACEFUL_RESTART_PERIOD") {
            cfg.cron_graceful_restart_period_secs =
                parse_optional_secs("CRON_GRACEFUL_RESTART_PERIOD", &value)?;
        }
        if let Some(value) = var("CRON") {
            cfg.cron = serde_json::from_str(&value)
                .map_err(|e| invalid(&format!("{ENV_PREFIX}CRON"), &e.to_string()))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Poll interval, or `None` when polling is disabled.
    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0.0)
            .then(|| Duration::try_from_secs_f64(self.poll_interval_secs).ok())
            .flatten()
    }

    /// Default shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(&self) -> ShutdownTimeout {
        ShutdownTimeout::from_seconds(self.shutdown_timeout_secs)
    }

    /// Back-fill window for missed cron ticks.
    #[must_use]
    pub fn cron_graceful_restart_period(&self) -> Option<Duration> {
        self.cron_graceful_restart_period_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Parsed queue pools.
    ///
    /// # Errors
    ///
    /// Malformed `queues` string.
    pub fn queue_pools(&self) -> Result<Vec<QueuePool>, ConfigError> {
        parse_queue_pools(&self.queues)
    }

    /// Retention cleanup, when records are preserved.
    #[must_use]
    pub fn cleanup_policy(&self) -> Option<CleanupPolicy> {
        self.preserve_job_records.then(|| CleanupPolicy {
            older_than: Duration::from_secs(self.cleanup_preserved_jobs_before_seconds_ago),
            every_jobs: (self.cleanup_interval_jobs > 0).then_some(self.cleanup_interval_jobs),
            every: (self.cleanup_interval_secs > 0)
                .then(|| Duration::from_secs(self.cleanup_interval_secs)),
        })
    }

    /// Notifier tuning derived from this configuration.
    #[must_use]
    pub fn notifier_options(&self) -> NotifierOptions {
        NotifierOptions {
            wait_interval: Duration::from_millis(self.listen_wait_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            ..NotifierOptions::default()
        }
    }

    /// Runtime entries for every configured cron key, in key order.
    ///
    /// # Errors
    ///
    /// The first entry that fails to build.
    pub fn cron_entries(&self) -> Result<Vec<CronEntry>, ConfigError> {
        self.cron
            .iter()
            .map(|(key, entry)| entry.clone().into_entry(key))
            .collect()
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn set_parsed<T: FromStr>(
    target: &mut T,
    name: &str,
    value: Option<String>,
) -> Result<(), ConfigError>
where
    T::Err: std::fmt::Display,
{
    if let Some(value) = value {
        *target = value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(&format!("{ENV_PREFIX}{name}"), &e.to_string()))?;
    }
    Ok(())
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(
            &format!("{ENV_PREFIX}{name}"),
            &format!("`{other}` is not a boolean"),
        )),
    }
}

fn parse_optional_secs(name: &str, value: &str) -> Result<Option<f64>, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "none" | "nil" | "null" => Ok(None),
        other => other
            .parse()
            .map(Some)
            .map_err(|e: std::num::ParseFloatError| {
                invalid(&format!("{ENV_PREFIX}{name}"), &e.to_string())
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.shutdown_timeout(), ShutdownTimeout::Forever);
        assert_eq!(cfg.poll_interval(), Some(Duration::from_secs(10)));
        assert_eq!(cfg.queue_pools().unwrap().len(), 1);
    }

    #[test]
    fn non_positive_poll_interval_disables_polling() {
        let cfg = EngineConfig {
            poll_interval_secs: 0.0,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.poll_interval(), None);
    }

    #[test]
    fn cleanup_follows_record_preservation() {
        let mut cfg = EngineConfig::default();
        let policy = cfg.cleanup_policy().unwrap();
        assert_eq!(policy.every_jobs, Some(1_000));
        assert_eq!(policy.every, Some(Duration::from_secs(600)));

        cfg.preserve_job_records = false;
        assert_eq!(cfg.cleanup_policy(), None);
    }
}
