//! Dedicated thread firing cron entries at their computed times.
//!
//! Each fire inserts one row stamped `(cron_key, cron_at)`. Racing processes
//! rely on the store's uniqueness over that pair; the loser sees a
//! duplicate and treats it as success.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::core::enqueue::Enqueuer;
use crate::core::error::{ConfigError, EngineError, ErrorReporter};
use crate::core::lifecycle::{Lifecycle, ShutdownTimeout, ThreadControl, ThreadSignals};
use crate::core::performable::JobRegistry;
use crate::core::performer::panic_message;
use crate::core::store::InsertOutcome;
use crate::util::clock;

use super::entry::CronEntry;

/// Longest uninterrupted sleep; wall-clock changes are noticed within it.
const MAX_SLEEP: Duration = Duration::from_secs(1);
/// Delay before retrying an entry whose next time could not be computed.
const RECOMPUTE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Action {
    Fire,
    Recompute,
}

struct CronInner {
    entries: Vec<CronEntry>,
    enqueuer: Enqueuer,
    reporter: ErrorReporter,
    overrides: RwLock<HashMap<String, bool>>,
    graceful_restart_period: RwLock<Option<Duration>>,
    control: ThreadControl,
    enqueued: AtomicU64,
}

/// Schedules and fires cron entries.
#[derive(Clone)]
pub struct CronManager {
    inner: Arc<CronInner>,
}

impl CronManager {
    /// Validate `entries` against `registry` and build the manager.
    ///
    /// # Errors
    ///
    /// [`ConfigError::DuplicateCronKey`] or [`ConfigError::MissingTarget`].
    pub fn new(
        entries: Vec<CronEntry>,
        registry: &JobRegistry,
        enqueuer: Enqueuer,
        reporter: ErrorReporter,
    ) -> Result<Self, ConfigError> {
        let mut keys = HashSet::new();
        for entry in &entries {
            if !keys.insert(entry.key().to_string()) {
                return Err(ConfigError::DuplicateCronKey(entry.key().to_string()));
            }
            if !registry.contains(entry.job_class()) {
                return Err(ConfigError::MissingTarget {
                    key: entry.key().to_string(),
                    job_class: entry.job_class().to_string(),
                });
            }
        }
        Ok(Self {
            inner: Arc::new(CronInner {
                entries,
                enqueuer,
                reporter,
                overrides: RwLock::new(HashMap::new()),
                graceful_restart_period: RwLock::new(None),
                control: ThreadControl::new(),
                enqueued: AtomicU64::new(0),
            }),
        })
    }

    /// On start, enqueue fire times missed within `period` before now.
    #[must_use]
    pub fn with_graceful_restart_period(self, period: Option<Duration>) -> Self {
        self.set_graceful_restart_period(period);
        self
    }

    /// Change the back-fill window used by the next [`start`](Self::start).
    /// Visible through every clone of this manager.
    pub fn set_graceful_restart_period(&self, period: Option<Duration>) {
        *self.inner.graceful_restart_period.write() = period;
    }

    /// Spawn the scheduling thread. No-op if already running or empty.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), EngineError> {
        if self.inner.entries.is_empty() {
            return Ok(());
        }
        let Some(signals) = self.inner.control.arm() else {
            return Ok(());
        };
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("job-cron".to_string())
            .spawn(move || inner.run(signals))?;
        info!(entries = self.inner.entries.len(), "cron manager started");
        Ok(())
    }

    /// Stop scheduling. Only `Forever` and `Within` wait for the thread.
    pub fn shutdown(&self, timeout: ShutdownTimeout) {
        self.inner.control.signal_stop();
        match timeout {
            ShutdownTimeout::NoWait | ShutdownTimeout::Immediate => {}
            ShutdownTimeout::Forever => {
                self.inner.control.wait(None);
            }
            ShutdownTimeout::Within(_) => {
                self.inner.control.wait(timeout.deadline());
            }
        }
    }

    /// Shut down, then start again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if the thread cannot be created.
    pub fn restart(&self, timeout: ShutdownTimeout) -> Result<(), EngineError> {
        self.shutdown(timeout);
        self.start()
    }

    /// Configured entries.
    #[must_use]
    pub fn entries(&self) -> &[CronEntry] {
        &self.inner.entries
    }

    /// Look up an entry.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&CronEntry> {
        self.inner.entries.iter().find(|e| e.key() == key)
    }

    /// Enable `key` at runtime. Returns false for unknown keys.
    pub fn enable(&self, key: &str) -> bool {
        self.set_override(key, true)
    }

    /// Disable `key` at runtime. Returns false for unknown keys.
    pub fn disable(&self, key: &str) -> bool {
        self.set_override(key, false)
    }

    /// Whether `key` would fire now; `None` for unknown keys.
    #[must_use]
    pub fn is_enabled(&self, key: &str) -> Option<bool> {
        let entry = self.entry(key)?;
        Some(self.inner.is_enabled(entry, clock::now()))
    }

    /// Enqueue the entry for fire time `cron_at`, as the scheduler would.
    ///
    /// # Errors
    ///
    /// Unknown key or store failure.
    pub fn enqueue_at(
        &self,
        key: &str,
        cron_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, EngineError> {
        let entry = self.entry(key).ok_or_else(|| EngineError::Cron {
            key: key.to_string(),
            message: "unknown cron entry".to_string(),
        })?;
        let outcome = self.inner.enqueuer.enqueue(entry.build_job(cron_at))?;
        if matches!(outcome, InsertOutcome::Inserted(_)) {
            self.inner.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// Enqueue the entry right now, outside its schedule and without dedup.
    ///
    /// # Errors
    ///
    /// Unknown key or store failure.
    pub fn enqueue_now(&self, key: &str) -> Result<InsertOutcome, EngineError> {
        let entry = self.entry(key).ok_or_else(|| EngineError::Cron {
            key: key.to_string(),
            message: "unknown cron entry".to_string(),
        })?;
        let mut job = entry.build_job(clock::now());
        job.cron_at = None;
        Ok(self.inner.enqueuer.enqueue(job)?)
    }

    /// Rows inserted by this manager.
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.inner.enqueued.load(Ordering::Relaxed)
    }

    /// Whether the scheduling thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.control.is_running()
    }

    fn set_override(&self, key: &str, enabled: bool) -> bool {
        if self.entry(key).is_none() {
            return false;
        }
        self.inner.overrides.write().insert(key.to_string(), enabled);
        info!(cron_key = key, enabled, "cron entry toggled");
        true
    }
}

impl Lifecycle for CronManager {
    fn shutdown(&self, timeout: ShutdownTimeout) {
        Self::shutdown(self, timeout);
    }

    fn wait_for_termination(&self, deadline: Option<Instant>) -> bool {
        self.inner.control.wait(deadline)
    }

    fn is_shutdown(&self) -> bool {
        self.inner.control.is_finished()
    }
}

impl fmt::Debug for CronManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.inner.entries.iter().map(CronEntry::key).collect();
        f.debug_struct("CronManager")
            .field("entries", &keys)
            .field("graceful_restart_period", &*self.inner.graceful_restart_period.read())
            .finish_non_exhaustive()
    }
}

/// Sleep until `target` in chunks, re-reading the wall clock after each.
/// Returns true if stopped.
fn sleep_until(target: DateTime<Utc>, stop: &Receiver<()>) -> bool {
    loop {
        let remaining = clock::until(target);
        if remaining.is_zero() {
            return false;
        }
        match stop.recv_timeout(remaining.min(MAX_SLEEP)) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return true,
        }
    }
}

impl CronInner {
    fn is_enabled(&self, entry: &CronEntry, at: DateTime<Utc>) -> bool {
        let overridden = self.overrides.read().get(entry.key()).copied();
        overridden.unwrap_or_else(|| entry.enabled_by_default(at))
    }

    fn run(&self, signals: ThreadSignals) {
        let ThreadSignals { stop, done } = signals;
        let mut heap: BinaryHeap<Reverse<(DateTime<Utc>, usize, Action)>> = BinaryHeap::new();

        self.backfill();
        for idx in 0..self.entries.len() {
            self.schedule(&mut heap, idx, None);
        }

        while let Some(Reverse((at, idx, action))) = heap.peek().copied() {
            if sleep_until(at, &stop) {
                break;
            }
            heap.pop();
            match action {
                Action::Fire => {
                    self.fire(idx, at);
                    self.schedule(&mut heap, idx, Some(at));
                }
                Action::Recompute => self.schedule(&mut heap, idx, None),
            }
        }
        if heap.is_empty() {
            // Every schedule is exhausted; idle until told to stop.
            let _ = stop.recv();
        }

        debug!("cron manager stopped");
        drop(done);
    }

    fn schedule(
        &self,
        heap: &mut BinaryHeap<Reverse<(DateTime<Utc>, usize, Action)>>,
        idx: usize,
        previously_at: Option<DateTime<Utc>>,
    ) {
        let entry = &self.entries[idx];
        let now = clock::now();
        let computed = panic::catch_unwind(AssertUnwindSafe(|| {
            entry
                .next_at(previously_at, now)
                .filter(|at| *at > now)
                .or_else(|| entry.next_at(None, now))
        }));
        match computed {
            Ok(Some(at)) => heap.push(Reverse((at, idx, Action::Fire))),
            Ok(None) => debug!(cron_key = entry.key(), "cron schedule exhausted"),
            Err(panic) => {
                self.reporter.report(&EngineError::Cron {
                    key: entry.key().to_string(),
                    message: format!(
                        "next time computation panicked: {}",
                        panic_message(panic.as_ref())
                    ),
                });
                heap.push(Reverse((clock::add(now, RECOMPUTE_AFTER), idx, Action::Recompute)));
            }
        }
    }

    fn fire(&self, idx: usize, cron_at: DateTime<Utc>) {
        let entry = &self.entries[idx];
        let key = entry.key();
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            if !self.is_enabled(entry, cron_at) {
                return Ok(None);
            }
            self.enqueuer.enqueue(entry.build_job(cron_at)).map(Some)
        }));
        match attempt {
            Ok(Ok(None)) => debug!(cron_key = key, %cron_at, "cron entry disabled; skipped"),
            Ok(Ok(Some(InsertOutcome::Inserted(job_id)))) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                info!(cron_key = key, job.id = %job_id, %cron_at, "cron job enqueued");
            }
            Ok(Ok(Some(InsertOutcome::Duplicate))) => {
                debug!(cron_key = key, %cron_at, "cron job already enqueued by another process");
            }
            Ok(Err(error)) => {
                warn!(cron_key = key, error = %error, "cron enqueue failed");
                self.reporter.report(&EngineError::Cron {
                    key: key.to_string(),
                    message: error.to_string(),
                });
            }
            Err(panic) => self.reporter.report(&EngineError::Cron {
                key: key.to_string(),
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }

    fn backfill(&self) {
        let Some(period) = *self.graceful_restart_period.read() else {
            return;
        };
        let now = clock::now();
        let start = clock::sub(now, period);
        for (idx, entry) in self.entries.iter().enumerate() {
            let missed = panic::catch_unwind(AssertUnwindSafe(|| entry.within(start, now)));
            match missed {
                Ok(times) => {
                    for at in times {
                        self.fire(idx, at);
                    }
                }
                Err(panic) => self.reporter.report(&EngineError::Cron {
                    key: entry.key().to_string(),
                    message: format!("back-fill panicked: {}", panic_message(panic.as_ref())),
                }),
            }
        }
    }
}
