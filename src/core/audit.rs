//! Execution audit trail.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::job::{JobId, JobRow};
use crate::util::clock::now_ms;

/// One recorded engine action on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related job.
    pub job_id: JobId,
    /// Queue of the job.
    pub queue: String,
    /// Job class.
    pub job_class: String,
    /// `succeeded`, `retried`, `failed`, `discarded`, `interrupted` or `deferred`.
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context such as error text.
    pub detail: Option<String>,
}

/// Destination for audit events.
pub trait AuditSink: Send {
    /// Record an event.
    fn record(&mut self, event: AuditEvent);
}

/// Bounded in-memory sink. Clones share the buffer.
#[derive(Debug, Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Sink keeping the last `max_events` events.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events,
        }
    }

    /// Snapshot of stored events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        if self.max_events > 0 {
            events.push_back(event);
        }
    }
}

/// Build an event for `row`.
pub fn build_audit_event(
    row: &JobRow,
    action: impl Into<String>,
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        job_id: row.id,
        queue: row.queue_name.clone(),
        job_class: row.job_class.clone(),
        action: action.into(),
        created_at_ms: now_ms(),
        detail,
    }
}

/// Audit sink shared between performers.
pub type SharedAuditSink = Arc<Mutex<Box<dyn AuditSink>>>;

/// Wrap `sink` for sharing.
pub fn shared_sink(sink: impl AuditSink + 'static) -> SharedAuditSink {
    let boxed: Box<dyn AuditSink> = Box::new(sink);
    Arc::new(Mutex::new(boxed))
}
