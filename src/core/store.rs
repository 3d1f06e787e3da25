//! Capability interface the engine requires from its backing store.
//!
//! A store owns the job table and two primitives: session-scoped exclusive
//! advisory locks that vanish when the session dies, and a pub/sub channel.
//! One `Store` value stands for one session; listeners get their own
//! connection through [`Store::listen`].

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::error::StoreError;
use crate::core::job::{JobFinish, JobRow, NewJob};
use crate::core::pause::PausedScopes;
use crate::core::queue_filter::QueueFilter;
use crate::core::wake::WakeHint;

/// Default pub/sub channel for wake-ups.
pub const NOTIFY_CHANNEL: &str = "job_engine";

/// Parameters of one claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Queues to consider.
    pub filter: QueueFilter,
    /// Scopes excluded by pauses.
    pub paused: PausedScopes,
    /// Concurrency keys with no free local slot.
    pub excluded_concurrency_keys: Vec<String>,
    /// Maximum number of candidates to try locking.
    pub lookahead: usize,
    /// Evaluation time for eligibility.
    pub now: DateTime<Utc>,
}

/// A row whose advisory lock is held by the claiming session.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    /// Snapshot of the row at claim time.
    pub row: JobRow,
    /// The lock key held.
    pub lock_key: i64,
}

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New row stored.
    Inserted(crate::core::job::JobId),
    /// A row with the same `(cron_key, cron_at)` already exists.
    Duplicate,
}

/// A dedicated listening connection.
pub trait Subscription: Send {
    /// Block up to `timeout` for one payload.
    ///
    /// # Errors
    ///
    /// [`StoreError::SubscriptionClosed`] when the connection is gone.
    fn next_message(&mut self, timeout: Duration) -> Result<Option<String>, StoreError>;
}

/// Store capability interface.
pub trait Store: Send + Sync {
    /// Select the best eligible row matching `request` and lock it without
    /// blocking. Locked candidates are skipped up to `request.lookahead`.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    fn claim_next(&self, request: &ClaimRequest) -> Result<Option<ClaimedJob>, StoreError>;

    /// Release the advisory lock taken by [`claim_next`](Self::claim_next).
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    fn release(&self, claimed: &ClaimedJob) -> Result<(), StoreError>;

    /// Insert a row, ignoring `(cron_key, cron_at)` duplicates.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    fn insert_job(&self, job: NewJob) -> Result<InsertOutcome, StoreError>;

    /// Persist the outcome of one execution attempt.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    fn mark_finished(&self, claimed: &ClaimedJob, finish: &JobFinish) -> Result<(), StoreError>;

    /// Whether LISTEN/NOTIFY is available.
    fn supports_listen(&self) -> bool;

    /// Open a dedicated connection listening on `channel`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Connection`] if the subscription cannot be established.
    fn listen(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError>;

    /// Publish `payload` on `channel`.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    fn notify(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Wake-ups for unfinished rows scheduled after `now`, soonest first.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    fn upcoming_scheduled(
        &self,
        _filter: &QueueFilter,
        _limit: usize,
        _now: DateTime<Utc>,
    ) -> Result<Vec<WakeHint>, StoreError> {
        Ok(Vec::new())
    }

    /// Delete finished rows older than `before`; returns how many.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    fn cleanup_finished(&self, _before: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }
}
