//! Inserting jobs and announcing them on the wake-up channel.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::error::StoreError;
use crate::core::job::NewJob;
use crate::core::store::{InsertOutcome, Store, NOTIFY_CHANNEL};
use crate::core::wake::WakeHint;

/// Inserts rows and publishes a wake-up for each new one.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn Store>,
    notify: bool,
    channel: String,
}

impl Enqueuer {
    /// Enqueuer notifying on the default channel when the store supports it.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        let notify = store.supports_listen();
        Self {
            store,
            notify,
            channel: NOTIFY_CHANNEL.to_string(),
        }
    }

    /// Publish on `channel` instead of the default.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Enable or disable wake-up publishing.
    #[must_use]
    pub const fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    /// Insert `job`; a new row is announced with its queue and due time.
    ///
    /// A failed announcement is logged only; the poller covers it.
    ///
    /// # Errors
    ///
    /// Propagates insert failures.
    pub fn enqueue(&self, job: NewJob) -> Result<InsertOutcome, StoreError> {
        let hint = Self::hint_for(&job);
        let outcome = self.store.insert_job(job)?;
        match outcome {
            InsertOutcome::Inserted(job_id) => {
                debug!(job.id = %job_id, queue = ?hint.queue_name, "job enqueued");
                if self.notify {
                    if let Err(error) = self.store.notify(&self.channel, &hint.to_payload()) {
                        warn!(error = %error, "failed to publish wake-up");
                    }
                }
            }
            InsertOutcome::Duplicate => debug!(queue = ?hint.queue_name, "duplicate job ignored"),
        }
        Ok(outcome)
    }

    /// Wake-up hint matching what [`enqueue`](Self::enqueue) publishes for `job`.
    #[must_use]
    pub fn hint_for(job: &NewJob) -> WakeHint {
        WakeHint {
            queue_name: Some(job.queue_name.clone()),
            scheduled_at: job.scheduled_at,
        }
    }
}

impl fmt::Debug for Enqueuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enqueuer")
            .field("notify", &self.notify)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
