//! Job rows, enqueue requests and execution outcomes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::util::clock;

/// Stable job identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// 64-bit advisory lock key derived from the identity.
    ///
    /// FNV-1a over `jobs-<uuid>`; identical on every process so that all
    /// workers contend for the same key.
    #[must_use]
    pub fn lock_key(&self) -> i64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0100_0000_01b3;
        let seed = format!("jobs-{}", self.0);
        let hash = seed
            .bytes()
            .fold(OFFSET, |acc, b| (acc ^ u64::from(b)).wrapping_mul(PRIME));
        i64::from_ne_bytes(hash.to_ne_bytes())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Numeric classification persisted next to a job's error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorEvent {
    /// Cooperative cancellation; always retried.
    Interrupted = 0,
    /// Fault with no retry policy handling it.
    Unhandled = 1,
    /// Fault handled by the performable itself.
    Handled = 2,
    /// Fault scheduled for another attempt.
    Retried = 3,
    /// Retries exhausted.
    RetryStopped = 4,
    /// Job discarded on request.
    Discarded = 5,
}

impl ErrorEvent {
    /// Numeric code stored on the row.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Opaque positional and keyword arguments handed to a performable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArguments {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
}

/// Request to insert a job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Identity the row will carry.
    pub id: JobId,
    /// Registered job class name.
    pub job_class: String,
    /// Queue the row belongs to.
    pub queue_name: String,
    /// Lower executes first.
    pub priority: i32,
    /// Earliest eligible execution time; `None` means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Concurrency key serializing related jobs.
    pub concurrency_key: Option<String>,
    /// Free-form labels (pausable).
    pub labels: Vec<String>,
    /// Performable arguments.
    pub arguments: JobArguments,
    /// Cron entry that produced this row.
    pub cron_key: Option<String>,
    /// Fire time the cron entry targeted.
    pub cron_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Start a request for `job_class` on the `default` queue.
    pub fn new(job_class: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            job_class: job_class.into(),
            queue_name: "default".to_string(),
            priority: 0,
            scheduled_at: None,
            concurrency_key: None,
            labels: Vec::new(),
            arguments: JobArguments::default(),
            cron_key: None,
            cron_at: None,
        }
    }

    /// Set the queue.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = queue.into();
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Schedule for an absolute time.
    #[must_use]
    pub const fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule `wait` from now.
    #[must_use]
    pub fn wait(mut self, wait: Duration) -> Self {
        self.scheduled_at = Some(clock::add(clock::now(), wait));
        self
    }

    /// Set the concurrency key.
    #[must_use]
    pub fn concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    /// Attach a label.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Set positional arguments.
    #[must_use]
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.arguments.args = args;
        self
    }

    /// Set keyword arguments.
    #[must_use]
    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.arguments.kwargs = kwargs;
        self
    }

    /// Stamp the cron origin used for `(cron_key, cron_at)` dedup.
    #[must_use]
    pub fn cron(mut self, key: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.cron_key = Some(key.into());
        self.cron_at = Some(at);
        self
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    /// Identity.
    pub id: JobId,
    /// Registered job class name.
    pub job_class: String,
    /// Queue name.
    pub queue_name: String,
    /// Lower executes first.
    pub priority: i32,
    /// Earliest eligible time.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Start of the most recent execution.
    pub performed_at: Option<DateTime<Utc>>,
    /// Set on terminal outcomes only.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last error text.
    pub error: Option<String>,
    /// Classification of the last error.
    pub error_event: Option<ErrorEvent>,
    /// Number of execution attempts so far.
    pub executions_count: u32,
    /// Concurrency key.
    pub concurrency_key: Option<String>,
    /// Labels.
    pub labels: Vec<String>,
    /// Performable arguments.
    pub arguments: JobArguments,
    /// Originating cron entry.
    pub cron_key: Option<String>,
    /// Originating cron fire time.
    pub cron_at: Option<DateTime<Utc>>,
}

impl JobRow {
    /// Materialize a row from an enqueue request.
    #[must_use]
    pub fn from_new(job: NewJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            job_class: job.job_class,
            queue_name: job.queue_name,
            priority: job.priority,
            scheduled_at: job.scheduled_at,
            created_at,
            performed_at: None,
            finished_at: None,
            error: None,
            error_event: None,
            executions_count: 0,
            concurrency_key: job.concurrency_key,
            labels: job.labels,
            arguments: job.arguments,
            cron_key: job.cron_key,
            cron_at: job.cron_at,
        }
    }

    /// Unfinished and due at `now`. Lock state is the store's concern.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.finished_at.is_none() && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// When the row became (or becomes) due.
    #[must_use]
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.created_at)
    }
}

/// What to persist for one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Terminal success; the row is kept as finished.
    Succeeded,
    /// Terminal success; the row is deleted.
    Destroy,
    /// Left unfinished and rescheduled.
    Retry {
        /// Next eligible time.
        scheduled_at: DateTime<Utc>,
        /// Error text.
        error: String,
        /// Classification.
        event: ErrorEvent,
    },
    /// Terminal failure.
    Failed {
        /// Error text.
        error: String,
        /// Classification.
        event: ErrorEvent,
    },
}

/// Finish record for one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFinish {
    /// When the attempt started.
    pub performed_at: DateTime<Utc>,
    /// When the attempt ended.
    pub finished_at: DateTime<Utc>,
    /// What happened.
    pub outcome: JobOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable_per_identity() {
        let id = JobId::new();
        assert_eq!(id.lock_key(), id.lock_key());
        assert_ne!(id.lock_key(), JobId::new().lock_key());
    }

    #[test]
    fn eligibility_respects_schedule_and_finish() {
        let now = clock::now();
        let mut row = JobRow::from_new(NewJob::new("Mailer"), now);
        assert!(row.is_eligible(now));

        row.scheduled_at = Some(clock::add(now, Duration::from_secs(30)));
        assert!(!row.is_eligible(now));
        assert!(row.is_eligible(clock::add(now, Duration::from_secs(30))));

        row.scheduled_at = None;
        row.finished_at = Some(now);
        assert!(!row.is_eligible(now));
    }

    #[test]
    fn error_event_codes() {
        assert_eq!(ErrorEvent::Interrupted.code(), 0);
        assert_eq!(ErrorEvent::Discarded.code(), 5);
    }
}
