//! A named recurring enqueue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::core::error::ConfigError;
use crate::core::job::NewJob;
use crate::util::clock;

use super::deferred::Deferred;
use super::schedule::CronSchedule;

/// Recurring schedule enqueueing one job per fire time.
#[derive(Debug, Clone)]
pub struct CronEntry {
    key: String,
    schedule: CronSchedule,
    job_class: String,
    args: Deferred<Vec<Value>>,
    kwargs: Deferred<Map<String, Value>>,
    queue: Option<Deferred<String>>,
    priority: Option<Deferred<i32>>,
    wait: Option<Deferred<Duration>>,
    concurrency_key: Option<Deferred<String>>,
    labels: Vec<String>,
    description: Option<String>,
    enabled: Deferred<bool>,
}

impl CronEntry {
    /// Entry parsing `schedule` as a cron expression or phrase.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidCron`] if the schedule cannot be parsed.
    pub fn new(
        key: impl Into<String>,
        schedule: &str,
        job_class: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let key = key.into();
        let parsed = CronSchedule::parse(schedule).map_err(|reason| ConfigError::InvalidCron {
            key: key.clone(),
            expression: schedule.to_string(),
            reason,
        })?;
        Ok(Self::with_schedule(key, parsed, job_class))
    }

    /// Entry with an already built schedule.
    pub fn with_schedule(
        key: impl Into<String>,
        schedule: CronSchedule,
        job_class: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            schedule,
            job_class: job_class.into(),
            args: Deferred::Static(Vec::new()),
            kwargs: Deferred::Static(Map::new()),
            queue: None,
            priority: None,
            wait: None,
            concurrency_key: None,
            labels: Vec::new(),
            description: None,
            enabled: Deferred::Static(true),
        }
    }

    /// Positional arguments.
    #[must_use]
    pub fn args(mut self, args: impl Into<Deferred<Vec<Value>>>) -> Self {
        self.args = args.into();
        self
    }

    /// Keyword arguments.
    #[must_use]
    pub fn kwargs(mut self, kwargs: impl Into<Deferred<Map<String, Value>>>) -> Self {
        self.kwargs = kwargs.into();
        self
    }

    /// Queue override.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<Deferred<String>>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Priority override.
    #[must_use]
    pub fn priority(mut self, priority: impl Into<Deferred<i32>>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    /// Delay after the fire time before the job becomes due.
    #[must_use]
    pub fn wait(mut self, wait: impl Into<Deferred<Duration>>) -> Self {
        self.wait = Some(wait.into());
        self
    }

    /// Concurrency key for enqueued jobs.
    #[must_use]
    pub fn concurrency_key(mut self, key: impl Into<Deferred<String>>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    /// Label attached to enqueued jobs.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Human description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Enabled flag, re-evaluated at every fire decision.
    #[must_use]
    pub fn enabled(mut self, enabled: impl Into<Deferred<bool>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    /// Unique key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Target job class.
    #[must_use]
    pub fn job_class(&self) -> &str {
        &self.job_class
    }

    /// The schedule.
    #[must_use]
    pub const fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    /// Description, if any.
    #[must_use]
    pub fn description_text(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Configured enabled flag at `at`, ignoring runtime overrides.
    #[must_use]
    pub fn enabled_by_default(&self, at: DateTime<Utc>) -> bool {
        self.enabled.evaluate(at)
    }

    /// Next fire time after `previously_at`, or after `now` if never fired.
    #[must_use]
    pub fn next_at(
        &self,
        previously_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.schedule.next_after(previously_at.unwrap_or(now))
    }

    /// Fire times in `[start, end)`.
    #[must_use]
    pub fn within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule.within(start, end)
    }

    /// The job enqueued for fire time `cron_at`, stamped for dedup.
    #[must_use]
    pub fn build_job(&self, cron_at: DateTime<Utc>) -> NewJob {
        let mut job = NewJob::new(self.job_class.clone())
            .args(self.args.evaluate(cron_at))
            .kwargs(self.kwargs.evaluate(cron_at))
            .cron(self.key.clone(), cron_at);
        if let Some(queue) = &self.queue {
            job = job.queue(queue.evaluate(cron_at));
        }
        if let Some(priority) = &self.priority {
            job = job.priority(priority.evaluate(cron_at));
        }
        if let Some(wait) = &self.wait {
            job = job.scheduled_at(clock::add(cron_at, wait.evaluate(cron_at)));
        }
        if let Some(key) = &self.concurrency_key {
            job = job.concurrency_key(key.evaluate(cron_at));
        }
        for label in &self.labels {
            job = job.label(label.clone());
        }
        job
    }
}
