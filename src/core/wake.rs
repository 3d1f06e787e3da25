//! Wake-up payloads and the targets that receive them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a wake-up is about. Both fields empty means "any queue, now".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeHint {
    /// Queue that received work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    /// When that work becomes due.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl WakeHint {
    /// Hint for immediately available work in `queue`.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queue_name: Some(queue.into()),
            scheduled_at: None,
        }
    }

    /// Set the due time.
    #[must_use]
    pub const fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    /// Due strictly after `now`.
    #[must_use]
    pub fn is_future(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_some_and(|at| at > now)
    }

    /// JSON payload published on the wake-up channel.
    #[must_use]
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse a channel payload; `None` for anything unrecognised.
    #[must_use]
    pub fn from_payload(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}

/// Anything that can be asked to start a claim-and-run cycle.
pub trait WakeTarget: Send + Sync {
    /// Try to start one cycle; returns whether a thread was actually started.
    ///
    /// Implementations must be capacity-gated so repeated calls are harmless.
    fn create_thread(&self, hint: Option<&WakeHint>) -> bool;
}
