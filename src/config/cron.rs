//! Serde mapping for cron entries declared in configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::cron::CronEntry;
use crate::core::error::ConfigError;

/// Per-enqueue overrides applied to every job an entry creates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronEnqueueOptions {
    /// Queue override.
    pub queue: Option<String>,
    /// Priority override.
    pub priority: Option<i32>,
    /// Delay after the fire time, in seconds.
    pub wait_secs: Option<f64>,
    /// Concurrency key.
    pub concurrency_key: Option<String>,
    /// Labels.
    pub labels: Vec<String>,
}

/// One configured cron entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronEntryConfig {
    /// Cron expression or natural-language phrase.
    pub cron: String,
    /// Job class to enqueue.
    pub class: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Enqueue overrides.
    #[serde(default)]
    pub set: CronEnqueueOptions,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the entry fires until toggled at runtime.
    #[serde(default = "default_enabled")]
    pub enabled_by_default: bool,
}

const fn default_enabled() -> bool {
    true
}

impl CronEntryConfig {
    /// Entry with the given schedule and class and no overrides.
    pub fn new(cron: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            cron: cron.into(),
            class: class.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            set: CronEnqueueOptions::default(),
            description: None,
            enabled_by_default: true,
        }
    }

    /// Build the runtime entry registered under `key`.
    ///
    /// # Errors
    ///
    /// Invalid schedule or a negative or non-finite wait.
    pub fn into_entry(self, key: &str) -> Result<CronEntry, ConfigError> {
        let mut entry = CronEntry::new(key, &self.cron, self.class)?
            .args(self.args)
            .kwargs(self.kwargs)
            .enabled(self.enabled_by_default);
        if let Some(queue) = self.set.queue {
            entry = entry.queue(queue);
        }
        if let Some(priority) = self.set.priority {
            entry = entry.priority(priority);
        }
        if let Some(wait) = self.set.wait_secs {
            let wait = Duration::try_from_secs_f64(wait).map_err(|e| ConfigError::InvalidValue {
                field: format!("cron.{key}.set.wait_secs"),
                reason: e.to_string(),
            })?;
            entry = entry.wait(wait);
        }
        if let Some(concurrency_key) = self.set.concurrency_key {
            entry = entry.concurrency_key(concurrency_key);
        }
        for label in self.set.labels {
            entry = entry.label(label);
        }
        if let Some(description) = self.description {
            entry = entry.description(description);
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock;

    #[test]
    fn deserializes_with_defaults() {
        let config: CronEntryConfig =
            serde_json::from_str(r#"{"cron": "*/5 * * * *", "class": "Sweep"}"#).unwrap();
        assert!(config.enabled_by_default);
        assert_eq!(config.set, CronEnqueueOptions::default());

        let entry = config.into_entry("sweep").unwrap();
        assert_eq!(entry.key(), "sweep");
        assert_eq!(entry.job_class(), "Sweep");
    }

    #[test]
    fn overrides_flow_into_built_jobs() {
        let config: CronEntryConfig = serde_json::from_str(
            r#"{"cron": "@hourly", "class": "Report", "set": {"queue": "reports", "priority": 3, "wait_secs": 5}}"#,
        )
        .unwrap();
        let job = config.into_entry("report").unwrap().build_job(clock::now());
        assert_eq!(job.queue_name, "reports");
        assert_eq!(job.priority, 3);
        assert!(job.scheduled_at.is_some());
    }

    #[test]
    fn negative_wait_is_rejected() {
        let mut config = CronEntryConfig::new("@daily", "Digest");
        config.set.wait_secs = Some(-1.0);
        assert!(matches!(
            config.into_entry("digest"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
