//! Error types for engine operations and the process-wide error hook.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::core::job::JobId;

/// Errors produced by a [`Store`](crate::core::Store) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store connection could not be used or established.
    #[error("connection error: {0}")]
    Connection(String),
    /// A pub/sub subscription was closed underneath its listener.
    #[error("subscription closed")]
    SubscriptionClosed,
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Configuration problems, surfaced when an entry or capsule is constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A cron schedule could not be parsed.
    #[error("cron entry `{key}` has invalid schedule `{expression}`: {reason}")]
    InvalidCron {
        /// Cron entry key.
        key: String,
        /// The schedule as written.
        expression: String,
        /// Parser message.
        reason: String,
    },
    /// A cron entry targets a job class with no registered performer.
    #[error("cron entry `{key}` targets unregistered job class `{job_class}`")]
    MissingTarget {
        /// Cron entry key.
        key: String,
        /// Job class the entry would enqueue.
        job_class: String,
    },
    /// Two cron entries share a key.
    #[error("duplicate cron entry key `{0}`")]
    DuplicateCronKey(String),
    /// A queue or queue-pool string could not be parsed.
    #[error("invalid queue string `{0}`")]
    InvalidQueues(String),
    /// A field has an unusable value.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Offending field or environment variable.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Fault raised by a [`Performable`](crate::core::Performable).
#[derive(Debug, Error)]
pub enum PerformError {
    /// The job failed; it may be retried according to its retry policy.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
    /// The job asked to be discarded without further retries.
    #[error("discarded: {0}")]
    Discard(String),
    /// The job dealt with a fault itself. The row finishes with the fault
    /// recorded; it is neither retried nor reported.
    #[error("handled: {0}")]
    Handled(String),
    /// Cooperative cancellation. Interrupted jobs are always retried.
    #[error("interrupted")]
    Interrupted,
}

/// Errors produced by engine components.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store or channel failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// A job raised a fault that no retry policy handled.
    #[error("job {job_id} ({job_class}) failed: {message}")]
    JobFailed {
        /// Failed job.
        job_id: JobId,
        /// Its job class.
        job_class: String,
        /// Error text recorded on the row.
        message: String,
    },
    /// Computing or enqueueing one cron entry failed.
    #[error("cron entry `{key}` failed: {message}")]
    Cron {
        /// Cron entry key.
        key: String,
        /// What went wrong.
        message: String,
    },
    /// A worker loop panicked outside of job execution.
    #[error("worker panicked: {0}")]
    WorkerPanic(String),
    /// Workers did not exit within the grace period after cancellation,
    /// usually because a job blocks its thread.
    #[error("scheduler `{scheduler}` workers still busy {grace:?} after cancellation")]
    WorkerStuck {
        /// Scheduler name.
        scheduler: String,
        /// Grace period that elapsed.
        grace: std::time::Duration,
    },
    /// A thread or runtime could not be created.
    #[error("failed to spawn: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Callback invoked for every error no component could resolve locally.
pub type ErrorHook = Arc<dyn Fn(&EngineError) + Send + Sync>;

/// Routes unresolved errors to a single hook.
///
/// Clones share the same hook slot, so installing a hook after components
/// were built still reaches all of them.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    hook: Arc<RwLock<Option<ErrorHook>>>,
}

impl ErrorReporter {
    /// Create a reporter with no hook installed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the hook.
    pub fn set_hook(&self, hook: impl Fn(&EngineError) + Send + Sync + 'static) {
        *self.hook.write() = Some(Arc::new(hook));
    }

    /// Remove the installed hook.
    pub fn clear_hook(&self) {
        *self.hook.write() = None;
    }

    /// Log `error` and hand it to the hook, if any.
    pub fn report(&self, error: &EngineError) {
        tracing::error!(error = %error, "unhandled engine error");
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook(error);
        }
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("hook_installed", &self.hook.read().is_some())
            .finish()
    }
}
