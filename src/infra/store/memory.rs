//! In-memory store with session-scoped advisory locks and pub/sub channels.
//!
//! Every [`InMemoryStore`] value is one session over a shared table.
//! [`InMemoryStore::session`] opens another session, standing in for a
//! second process or connection. Terminating a session releases its locks,
//! which is how a crashed worker's claims become claimable again.

use std::cmp::{Ordering, Reverse};
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::error::StoreError;
use crate::core::job::{JobFinish, JobId, JobOutcome, JobRow, NewJob};
use crate::core::queue_filter::QueueFilter;
use crate::core::store::{ClaimRequest, ClaimedJob, InsertOutcome, Store, Subscription};
use crate::core::wake::WakeHint;
use crate::util::clock;

/// Claim ordering: filter rank, priority, due time, enqueue time, identity.
struct Candidate<'a> {
    rank: usize,
    row: &'a JobRow,
}

impl Candidate<'_> {
    fn sort_key(&self) -> (usize, i32, DateTime<Utc>, DateTime<Utc>, JobId) {
        (
            self.rank,
            self.row.priority,
            self.row.ready_at(),
            self.row.created_at,
            self.row.id,
        )
    }
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.row.id == other.row.id
    }
}

impl Eq for Candidate<'_> {}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[derive(Default)]
struct JobTable {
    rows: HashMap<JobId, JobRow>,
    cron_index: HashSet<(String, DateTime<Utc>)>,
}

impl JobTable {
    fn remove(&mut self, id: &JobId) -> Option<JobRow> {
        let row = self.rows.remove(id)?;
        if let (Some(key), Some(at)) = (&row.cron_key, row.cron_at) {
            self.cron_index.remove(&(key.clone(), at));
        }
        Some(row)
    }
}

struct Shared {
    // Lock order: jobs, then locks.
    jobs: Mutex<JobTable>,
    locks: Mutex<HashMap<i64, u64>>,
    channels: Mutex<HashMap<String, Vec<Sender<String>>>>,
    terminated: Mutex<HashSet<u64>>,
    listen_enabled: AtomicBool,
    next_session: AtomicU64,
}

/// One session over a shared in-memory job table.
pub struct InMemoryStore {
    shared: Arc<Shared>,
    session: u64,
}

impl InMemoryStore {
    /// Empty table with one open session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(JobTable::default()),
                locks: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                terminated: Mutex::new(HashSet::new()),
                listen_enabled: AtomicBool::new(true),
                next_session: AtomicU64::new(2),
            }),
            session: 1,
        }
    }

    /// Open another session over the same table.
    #[must_use]
    pub fn session(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            session: self.shared.next_session.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn session_id(&self) -> u64 {
        self.session
    }

    /// Simulate the session dying: its locks are released and every later
    /// call on it fails.
    pub fn terminate_session(&self) {
        self.shared.terminated.lock().insert(self.session);
        let mut locks = self.shared.locks.lock();
        let before = locks.len();
        locks.retain(|_, owner| *owner != self.session);
        debug!(session = self.session, released = before - locks.len(), "session terminated");
    }

    /// Toggle pub/sub availability. Disabling also drops live listeners.
    pub fn set_listen_enabled(&self, enabled: bool) {
        self.shared.listen_enabled.store(enabled, AtomicOrdering::SeqCst);
        if !enabled {
            self.disconnect_listeners();
        }
    }

    /// Close every live subscription.
    pub fn disconnect_listeners(&self) {
        self.shared.channels.lock().clear();
    }

    /// Subscriptions registered on `channel`. Closed ones are pruned on
    /// the next notify.
    #[must_use]
    pub fn listener_count(&self, channel: &str) -> usize {
        self.shared.channels.lock().get(channel).map_or(0, Vec::len)
    }

    /// Snapshot of one row.
    #[must_use]
    pub fn job(&self, id: JobId) -> Option<JobRow> {
        self.shared.jobs.lock().rows.get(&id).cloned()
    }

    /// Snapshot of every row, oldest first.
    #[must_use]
    pub fn jobs(&self) -> Vec<JobRow> {
        let mut rows: Vec<JobRow> = self.shared.jobs.lock().rows.values().cloned().collect();
        rows.sort_by_key(|row| (row.created_at, row.id));
        rows
    }

    /// Number of unfinished rows.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared
            .jobs
            .lock()
            .rows
            .values()
            .filter(|row| row.finished_at.is_none())
            .count()
    }

    /// Whether any session holds the lock for `id`.
    #[must_use]
    pub fn is_locked(&self, id: JobId) -> bool {
        self.shared.locks.lock().contains_key(&id.lock_key())
    }

    fn ensure_alive(&self) -> Result<(), StoreError> {
        if self.shared.terminated.lock().contains(&self.session) {
            return Err(StoreError::Connection(format!(
                "session {} terminated",
                self.session
            )));
        }
        Ok(())
    }

    fn ensure_listen(&self) -> Result<(), StoreError> {
        if self.shared.listen_enabled.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Connection("pub/sub unavailable".to_string()))
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("session", &self.session)
            .field("rows", &self.shared.jobs.lock().rows.len())
            .field("locks", &self.shared.locks.lock().len())
            .finish_non_exhaustive()
    }
}

impl Store for InMemoryStore {
    fn claim_next(&self, request: &ClaimRequest) -> Result<Option<ClaimedJob>, StoreError> {
        self.ensure_alive()?;
        let jobs = self.shared.jobs.lock();
        let mut heap: BinaryHeap<Reverse<Candidate<'_>>> = jobs
            .rows
            .values()
            .filter(|row| {
                row.is_eligible(request.now)
                    && request.filter.matches(&row.queue_name)
                    && !request.paused.excludes(row)
                    && row
                        .concurrency_key
                        .as_ref()
                        .is_none_or(|key| !request.excluded_concurrency_keys.contains(key))
            })
            .map(|row| {
                Reverse(Candidate {
                    rank: request.filter.rank(&row.queue_name),
                    row,
                })
            })
            .collect();

        let mut locks = self.shared.locks.lock();
        for _ in 0..request.lookahead.max(1) {
            let Some(Reverse(candidate)) = heap.pop() else {
                break;
            };
            let lock_key = candidate.row.id.lock_key();
            match locks.entry(lock_key) {
                Entry::Vacant(slot) => {
                    slot.insert(self.session);
                    return Ok(Some(ClaimedJob {
                        row: candidate.row.clone(),
                        lock_key,
                    }));
                }
                Entry::Occupied(_) => {
                    debug!(job.id = %candidate.row.id, "candidate locked by another claim");
                }
            }
        }
        Ok(None)
    }

    fn release(&self, claimed: &ClaimedJob) -> Result<(), StoreError> {
        self.ensure_alive()?;
        let mut locks = self.shared.locks.lock();
        match locks.get(&claimed.lock_key) {
            Some(owner) if *owner == self.session => {
                locks.remove(&claimed.lock_key);
            }
            _ => warn!(
                job.id = %claimed.row.id,
                session = self.session,
                "release of a lock not held"
            ),
        }
        Ok(())
    }

    fn insert_job(&self, job: NewJob) -> Result<InsertOutcome, StoreError> {
        self.ensure_alive()?;
        let mut jobs = self.shared.jobs.lock();
        if let (Some(key), Some(at)) = (&job.cron_key, job.cron_at) {
            if !jobs.cron_index.insert((key.clone(), at)) {
                return Ok(InsertOutcome::Duplicate);
            }
        }
        let id = job.id;
        jobs.rows.insert(id, JobRow::from_new(job, clock::now()));
        Ok(InsertOutcome::Inserted(id))
    }

    fn mark_finished(&self, claimed: &ClaimedJob, finish: &JobFinish) -> Result<(), StoreError> {
        self.ensure_alive()?;
        let id = claimed.row.id;
        let mut jobs = self.shared.jobs.lock();
        if matches!(finish.outcome, JobOutcome::Destroy) {
            return jobs
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| StoreError::Backend(format!("job {id} not found")));
        }
        let row = jobs
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Backend(format!("job {id} not found")))?;
        row.executions_count = row.executions_count.saturating_add(1);
        row.performed_at = Some(finish.performed_at);
        match &finish.outcome {
            JobOutcome::Succeeded => {
                row.finished_at = Some(finish.finished_at);
                row.error = None;
                row.error_event = None;
            }
            JobOutcome::Retry {
                scheduled_at,
                error,
                event,
            } => {
                row.scheduled_at = Some(*scheduled_at);
                row.error = Some(error.clone());
                row.error_event = Some(*event);
            }
            JobOutcome::Failed { error, event } => {
                row.finished_at = Some(finish.finished_at);
                row.error = Some(error.clone());
                row.error_event = Some(*event);
            }
            JobOutcome::Destroy => {}
        }
        Ok(())
    }

    fn supports_listen(&self) -> bool {
        true
    }

    fn listen(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError> {
        self.ensure_alive()?;
        self.ensure_listen()?;
        let (tx, rx) = unbounded();
        self.shared
            .channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Box::new(MemorySubscription { rx }))
    }

    fn notify(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.ensure_alive()?;
        self.ensure_listen()?;
        if let Some(listeners) = self.shared.channels.lock().get_mut(channel) {
            listeners.retain(|tx| tx.send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    fn upcoming_scheduled(
        &self,
        filter: &QueueFilter,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<WakeHint>, StoreError> {
        self.ensure_alive()?;
        let jobs = self.shared.jobs.lock();
        let mut upcoming: Vec<(DateTime<Utc>, &str)> = jobs
            .rows
            .values()
            .filter(|row| row.finished_at.is_none() && filter.matches(&row.queue_name))
            .filter_map(|row| {
                row.scheduled_at
                    .filter(|at| *at > now)
                    .map(|at| (at, row.queue_name.as_str()))
            })
            .collect();
        upcoming.sort_unstable();
        Ok(upcoming
            .into_iter()
            .take(limit)
            .map(|(at, queue)| WakeHint::queue(queue).at(at))
            .collect())
    }

    fn cleanup_finished(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.ensure_alive()?;
        let mut jobs = self.shared.jobs.lock();
        let expired: Vec<JobId> = jobs
            .rows
            .values()
            .filter(|row| row.finished_at.is_some_and(|at| at < before))
            .map(|row| row.id)
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        Ok(expired.len())
    }
}

struct MemorySubscription {
    rx: Receiver<String>,
}

impl Subscription for MemorySubscription {
    fn next_message(&mut self, timeout: Duration) -> Result<Option<String>, StoreError> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::SubscriptionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::ErrorEvent;
    use crate::core::pause::PausedScopes;

    fn request(filter: &str) -> ClaimRequest {
        ClaimRequest {
            filter: filter.parse().unwrap(),
            paused: PausedScopes::default(),
            excluded_concurrency_keys: Vec::new(),
            lookahead: 10,
            now: clock::now(),
        }
    }

    fn finish(outcome: JobOutcome) -> JobFinish {
        let now = clock::now();
        JobFinish {
            performed_at: now,
            finished_at: now,
            outcome,
        }
    }

    #[test]
    fn claims_follow_priority_then_enqueue_order() {
        let store = InMemoryStore::new();
        store.insert_job(NewJob::new("A").priority(10)).unwrap();
        let urgent = NewJob::new("B").priority(-1);
        let urgent_id = urgent.id;
        store.insert_job(urgent).unwrap();

        let claimed = store.claim_next(&request("*")).unwrap().unwrap();
        assert_eq!(claimed.row.id, urgent_id);
    }

    #[test]
    fn a_locked_row_is_skipped_by_other_sessions() {
        let first = InMemoryStore::new();
        let second = first.session();
        first.insert_job(NewJob::new("Only")).unwrap();

        let claimed = first.claim_next(&request("*")).unwrap().unwrap();
        assert!(second.claim_next(&request("*")).unwrap().is_none());

        first.release(&claimed).unwrap();
        assert!(second.claim_next(&request("*")).unwrap().is_some());
    }

    #[test]
    fn terminating_a_session_releases_its_locks() {
        let crashed = InMemoryStore::new();
        let survivor = crashed.session();
        let job = NewJob::new("Resilient");
        let id = job.id;
        crashed.insert_job(job).unwrap();

        crashed.claim_next(&request("*")).unwrap().unwrap();
        assert!(survivor.is_locked(id));

        crashed.terminate_session();
        assert!(!survivor.is_locked(id));
        assert!(crashed.claim_next(&request("*")).is_err());
        assert_eq!(survivor.claim_next(&request("*")).unwrap().unwrap().row.id, id);
    }

    #[test]
    fn cron_rows_are_unique_per_key_and_time() {
        let store = InMemoryStore::new();
        let at = clock::now();
        let first = store.insert_job(NewJob::new("Tick").cron("tick", at)).unwrap();
        let second = store.insert_job(NewJob::new("Tick").cron("tick", at)).unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));
        assert_eq!(second, InsertOutcome::Duplicate);
        assert_eq!(store.jobs().len(), 1);
    }

    #[test]
    fn retry_outcome_leaves_the_row_pending() {
        let store = InMemoryStore::new();
        store.insert_job(NewJob::new("Flaky")).unwrap();
        let claimed = store.claim_next(&request("*")).unwrap().unwrap();
        let retry_at = clock::add(clock::now(), Duration::from_secs(60));
        store
            .mark_finished(
                &claimed,
                &finish(JobOutcome::Retry {
                    scheduled_at: retry_at,
                    error: "boom".to_string(),
                    event: ErrorEvent::Retried,
                }),
            )
            .unwrap();
        store.release(&claimed).unwrap();

        let row = store.job(claimed.row.id).unwrap();
        assert!(row.finished_at.is_none());
        assert_eq!(row.executions_count, 1);
        assert_eq!(row.error_event, Some(ErrorEvent::Retried));
        assert!(store.claim_next(&request("*")).unwrap().is_none());

        let upcoming = store
            .upcoming_scheduled(&QueueFilter::All, 10, clock::now())
            .unwrap();
        assert_eq!(upcoming, vec![WakeHint::queue("default").at(retry_at)]);
    }

    #[test]
    fn subscriptions_receive_notifications_until_disconnected() {
        let store = InMemoryStore::new();
        let mut subscription = store.listen("wake").unwrap();
        store.notify("wake", "{}").unwrap();
        assert_eq!(
            subscription.next_message(Duration::from_millis(50)).unwrap().as_deref(),
            Some("{}")
        );
        assert!(subscription.next_message(Duration::from_millis(10)).unwrap().is_none());

        store.set_listen_enabled(false);
        assert!(matches!(
            subscription.next_message(Duration::from_millis(10)),
            Err(StoreError::SubscriptionClosed)
        ));
        assert!(store.listen("wake").is_err());
    }

    #[test]
    fn cleanup_removes_old_finished_rows() {
        let store = InMemoryStore::new();
        store.insert_job(NewJob::new("Done")).unwrap();
        let claimed = store.claim_next(&request("*")).unwrap().unwrap();
        store.mark_finished(&claimed, &finish(JobOutcome::Succeeded)).unwrap();
        store.release(&claimed).unwrap();

        let hour_ago = clock::sub(clock::now(), Duration::from_secs(60));
        assert_eq!(store.cleanup_finished(hour_ago).unwrap(), 0);
        let soon = clock::add(clock::now(), Duration::from_secs(1));
        assert_eq!(store.cleanup_finished(soon).unwrap(), 1);
        assert!(store.jobs().is_empty());
    }
}
