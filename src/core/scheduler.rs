//! Thread-pool scheduler that claims and runs jobs for one queue filter.
//!
//! Each scheduler owns `max_threads` dedicated OS threads. A thread sleeps on
//! a bounded channel until [`Scheduler::create_thread`] hands it a dispatch
//! token, then drains claimable work until nothing is left.
//!
//! # Shutdown
//!
//! | timeout                      | behaviour                                   |
//! |------------------------------|---------------------------------------------|
//! | [`ShutdownTimeout::NoWait`]  | stop claiming, return immediately           |
//! | [`ShutdownTimeout::Forever`] | stop claiming, wait for in-flight jobs      |
//! | [`ShutdownTimeout::Immediate`] | stop claiming, cancel and reap in-flight jobs |
//! | [`ShutdownTimeout::Within`]  | wait up to the duration, then cancel        |
//!
//! Cancelled jobs are recorded as interrupted and retried. A cancelling
//! shutdown returns once their outcomes are persisted, or after
//! [`CANCEL_GRACE`] if a job blocks its thread.

mod cache;
mod pool;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::core::error::{EngineError, ErrorReporter};
use crate::core::lifecycle::{Lifecycle, ShutdownTimeout};
use crate::core::performer::{ExecutionResult, JobPerformer};
use crate::core::wake::{WakeHint, WakeTarget};
use crate::util::clock;

use cache::WakeCache;
use pool::{Generation, WorkToken};

/// How long a cancelling shutdown waits for interrupted jobs to record
/// their outcome.
pub const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Periodic removal of preserved finished rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Rows finished longer ago than this are deleted.
    pub older_than: Duration,
    /// Run after this many executions.
    pub every_jobs: Option<u64>,
    /// Run when this much time passed since the last run.
    pub every: Option<Duration>,
}

/// Scheduler sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Name used for threads and logs.
    pub name: String,
    /// Maximum concurrently executing jobs.
    pub max_threads: usize,
    /// Maximum buffered future wake-ups; zero disables the cache.
    pub max_cache: usize,
    /// Optional retention cleanup.
    pub cleanup: Option<CleanupPolicy>,
}

impl SchedulerOptions {
    /// Options with `max_threads` workers and a 10 000 entry cache.
    pub fn new(name: impl Into<String>, max_threads: usize) -> Self {
        Self {
            name: name.into(),
            max_threads,
            max_cache: 10_000,
            cleanup: None,
        }
    }

    /// Set the cache bound.
    #[must_use]
    pub fn with_max_cache(mut self, max_cache: usize) -> Self {
        self.max_cache = max_cache;
        self
    }

    /// Enable retention cleanup.
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = Some(cleanup);
        self
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    /// Built, not started.
    Created = 0,
    /// Accepting wake-ups.
    Running = 1,
    /// No longer claiming; jobs may still be in flight.
    ShuttingDown = 2,
    /// Fully stopped.
    Shutdown = 3,
}

impl SchedulerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Shutdown,
        }
    }
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Scheduler name.
    pub name: String,
    /// Queue filter.
    pub queues: String,
    /// Lifecycle state.
    pub state: SchedulerState,
    /// Configured thread bound.
    pub max_threads: usize,
    /// Threads dispatched or executing.
    pub active_threads: usize,
    /// Threads free for dispatch.
    pub available_threads: usize,
    /// Configured cache bound.
    pub max_cache: usize,
    /// Buffered future wake-ups.
    pub cached_wakeups: usize,
    /// Jobs that succeeded.
    pub succeeded: u64,
    /// Jobs that raised a fault.
    pub errored: u64,
    /// Claim attempts that found nothing.
    pub empty_claims: u64,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    errored: AtomicU64,
    empty_claims: AtomicU64,
    since_cleanup: AtomicU64,
}

pub(crate) struct SchedulerInner {
    options: SchedulerOptions,
    performer: Arc<JobPerformer>,
    reporter: ErrorReporter,
    state: AtomicU8,
    /// Held for reading across each claim; shutdown takes it for writing.
    accepting: RwLock<bool>,
    work_tx: Mutex<Option<Sender<WorkToken>>>,
    generations: Mutex<Vec<Generation>>,
    in_flight: AtomicUsize,
    counters: Counters,
    last_cleanup: Mutex<Instant>,
    cache: WakeCache,
}

/// Claims and runs jobs on a bounded pool of worker threads.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build a scheduler in the created state.
    #[must_use]
    pub fn new(
        options: SchedulerOptions,
        performer: JobPerformer,
        reporter: ErrorReporter,
    ) -> Self {
        let cache = WakeCache::new(options.max_cache);
        Self {
            inner: Arc::new(SchedulerInner {
                options,
                performer: Arc::new(performer),
                reporter,
                state: AtomicU8::new(SchedulerState::Created as u8),
                accepting: RwLock::new(false),
                work_tx: Mutex::new(None),
                generations: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                counters: Counters::default(),
                last_cleanup: Mutex::new(Instant::now()),
                cache,
            }),
        }
    }

    /// Spawn the worker threads, warm the cache and start accepting wake-ups.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if a thread cannot be created.
    pub fn start(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        if inner.state() == SchedulerState::Running {
            return Ok(());
        }
        inner.generations.lock().retain(|g| !g.is_finished());

        let (sender, generation) = pool::spawn_workers(&self.inner)?;
        inner.generations.lock().push(generation);
        *inner.work_tx.lock() = Some(sender);

        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        inner.cache.start(&inner.options.name, move |hint| {
            if let Some(inner) = weak.upgrade() {
                inner.create_thread(Some(&hint));
            }
        })?;

        *inner.accepting.write() = true;
        inner.set_state(SchedulerState::Running);
        inner.warm_cache();
        info!(
            scheduler = %inner.options.name,
            queues = %inner.performer.filter(),
            max_threads = inner.options.max_threads,
            max_cache = inner.options.max_cache,
            "scheduler started"
        );
        Ok(())
    }

    /// Try to dispatch one claim-and-run cycle.
    ///
    /// Returns false when not running, the hint concerns other queues, the
    /// hint is for the future (it is cached instead), or all threads are busy.
    pub fn create_thread(&self, hint: Option<&WakeHint>) -> bool {
        self.inner.create_thread(hint)
    }

    /// Stop claiming and apply `timeout` to in-flight jobs. Never errors.
    pub fn shutdown(&self, timeout: ShutdownTimeout) {
        self.inner.shutdown(timeout);
    }

    /// Shut down with `timeout`, then start again with the same options.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if threads cannot be recreated.
    pub fn restart(&self, timeout: ShutdownTimeout) -> Result<(), EngineError> {
        self.shutdown(timeout);
        self.start()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.inner.refresh_state()
    }

    /// Whether the scheduler accepts wake-ups.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Whether a wake-up for `hint` concerns this scheduler.
    #[must_use]
    pub fn accepts(&self, hint: Option<&WakeHint>) -> bool {
        self.inner.performer.accepts(hint)
    }

    /// The job performer.
    #[must_use]
    pub fn performer(&self) -> &JobPerformer {
        &self.inner.performer
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let inner = &self.inner;
        let active = inner.in_flight.load(Ordering::Acquire);
        SchedulerStats {
            name: inner.options.name.clone(),
            queues: inner.performer.filter().to_string(),
            state: inner.refresh_state(),
            max_threads: inner.options.max_threads,
            active_threads: active,
            available_threads: inner.options.max_threads.saturating_sub(active),
            max_cache: inner.options.max_cache,
            cached_wakeups: inner.cache.len(),
            succeeded: inner.counters.succeeded.load(Ordering::Relaxed),
            errored: inner.counters.errored.load(Ordering::Relaxed),
            empty_claims: inner.counters.empty_claims.load(Ordering::Relaxed),
        }
    }
}

impl Lifecycle for Scheduler {
    fn shutdown(&self, timeout: ShutdownTimeout) {
        self.inner.shutdown(timeout);
    }

    fn wait_for_termination(&self, deadline: Option<Instant>) -> bool {
        self.inner.wait_for_termination(deadline)
    }

    fn is_shutdown(&self) -> bool {
        self.state() == SchedulerState::Shutdown
    }
}

impl WakeTarget for Scheduler {
    fn create_thread(&self, hint: Option<&WakeHint>) -> bool {
        self.inner.create_thread(hint)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.options.name)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl SchedulerInner {
    fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn refresh_state(&self) -> SchedulerState {
        let state = self.state();
        if state == SchedulerState::ShuttingDown && self.is_terminated() {
            let _ = self.state.compare_exchange(
                SchedulerState::ShuttingDown as u8,
                SchedulerState::Shutdown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return self.state();
        }
        state
    }

    fn is_terminated(&self) -> bool {
        self.generations.lock().iter().all(Generation::is_finished)
    }

    pub(crate) fn create_thread(&self, hint: Option<&WakeHint>) -> bool {
        if self.state() != SchedulerState::Running || !self.performer.accepts(hint) {
            return false;
        }
        if let Some(hint) = hint.filter(|h| h.is_future(clock::now())) {
            if self.cache.push(hint.clone()) {
                debug!(
                    scheduler = %self.options.name,
                    at = ?hint.scheduled_at,
                    "cached future wake-up"
                );
            }
            return false;
        }

        let max = self.options.max_threads;
        if self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return false;
        }
        let sent = self
            .work_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.try_send(WorkToken).is_ok());
        if !sent {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        sent
    }

    fn shutdown(&self, timeout: ShutdownTimeout) {
        match self.state() {
            SchedulerState::Created => {
                self.set_state(SchedulerState::Shutdown);
                return;
            }
            SchedulerState::Shutdown => return,
            SchedulerState::Running => {
                *self.accepting.write() = false;
                self.set_state(SchedulerState::ShuttingDown);
                self.work_tx.lock().take();
                self.cache.stop();
                info!(scheduler = %self.options.name, ?timeout, "scheduler shutting down");
            }
            SchedulerState::ShuttingDown => {}
        }

        match timeout {
            ShutdownTimeout::NoWait => {}
            ShutdownTimeout::Forever => {
                self.wait_for_termination(None);
            }
            ShutdownTimeout::Immediate => self.cancel_and_wait(),
            ShutdownTimeout::Within(_) => {
                if !self.wait_for_termination(timeout.deadline()) {
                    self.cancel_and_wait();
                }
            }
        }
        if self.refresh_state() == SchedulerState::Shutdown {
            info!(scheduler = %self.options.name, "scheduler shut down");
        }
    }

    /// Cancel in-flight jobs and wait for their outcomes to be persisted.
    /// A job blocking its worker thread past [`CANCEL_GRACE`] is reported
    /// and left behind.
    fn cancel_and_wait(&self) {
        self.cancel_in_flight();
        if !self.wait_for_termination(Instant::now().checked_add(CANCEL_GRACE)) {
            warn!(
                scheduler = %self.options.name,
                grace = ?CANCEL_GRACE,
                "workers still busy after cancellation"
            );
            self.reporter.report(&EngineError::WorkerStuck {
                scheduler: self.options.name.clone(),
                grace: CANCEL_GRACE,
            });
        }
    }

    fn cancel_in_flight(&self) {
        let generations = self.generations.lock();
        let running = generations.iter().filter(|g| !g.is_finished()).count();
        if running > 0 {
            warn!(scheduler = %self.options.name, "cancelling in-flight jobs");
        }
        for generation in generations.iter() {
            generation.cancel();
        }
    }

    fn wait_for_termination(&self, deadline: Option<Instant>) -> bool {
        let waiting: Vec<_> = self.generations.lock().iter().map(Generation::done).collect();
        let finished = waiting.iter().all(|done| pool::wait_done(done, deadline))
            && self.cache.wait(deadline);
        if finished {
            self.refresh_state();
        }
        finished
    }

    fn warm_cache(&self) {
        if self.options.max_cache == 0 {
            return;
        }
        match self.performer.upcoming(self.options.max_cache) {
            Ok(hints) => {
                let cached = hints.into_iter().filter(|h| self.cache.push(h.clone())).count();
                if cached > 0 {
                    debug!(scheduler = %self.options.name, cached, "warmed wake-up cache");
                }
            }
            Err(error) => self.reporter.report(&EngineError::Store(error)),
        }
    }

    fn record(&self, result: &ExecutionResult) {
        let counter = match result {
            ExecutionResult::Succeeded { .. } => &self.counters.succeeded,
            ExecutionResult::Errored { .. } => &self.counters.errored,
            ExecutionResult::NoWork => &self.counters.empty_claims,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = result.unhandled_error() {
            self.reporter.report(&error);
        }
    }

    fn maybe_cleanup(&self) {
        let Some(policy) = self.options.cleanup else {
            return;
        };
        let count = self.counters.since_cleanup.fetch_add(1, Ordering::AcqRel) + 1;
        let by_count = policy.every_jobs.is_some_and(|every| count >= every);
        let by_time = policy
            .every
            .is_some_and(|every| self.last_cleanup.lock().elapsed() >= every);
        if !by_count && !by_time {
            return;
        }
        self.counters.since_cleanup.store(0, Ordering::Release);
        *self.last_cleanup.lock() = Instant::now();
        if let Err(error) = self.performer.cleanup(policy.older_than) {
            self.reporter.report(&EngineError::Store(error));
        }
    }
}
