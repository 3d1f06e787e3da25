//! Composition root tying schedulers, wake-up sources and cron together.
//!
//! An [`EngineContext`] is the process-scoped registry of live capsules. It
//! also carries the error hook and pause switches shared by its capsules.
//! [`EngineContext::global`] is the default context; tests build their own.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::info;

use crate::core::concurrency::ConcurrencyLimiter;
use crate::core::cron::CronManager;
use crate::core::enqueue::Enqueuer;
use crate::core::error::{EngineError, ErrorReporter, StoreError};
use crate::core::job::NewJob;
use crate::core::lifecycle::{shutdown_all, Lifecycle, ShutdownTimeout};
use crate::core::multi_scheduler::MultiScheduler;
use crate::core::notifier::Notifier;
use crate::core::pause::{PauseRegistry, PauseScope};
use crate::core::performable::JobRegistry;
use crate::core::performer::{perform_inline, JobPerformer};
use crate::core::poller::Poller;
use crate::core::queue_filter::QueueFilter;
use crate::core::scheduler::SchedulerStats;
use crate::core::store::{InsertOutcome, Store};
use crate::core::wake::WakeHint;

static GLOBAL: OnceLock<Arc<EngineContext>> = OnceLock::new();

/// Process-scoped registry of capsules plus shared operational state.
pub struct EngineContext {
    capsules: Mutex<Vec<(u64, Weak<CapsuleInner>)>>,
    next_id: AtomicU64,
    reporter: ErrorReporter,
    pauses: Arc<PauseRegistry>,
}

impl EngineContext {
    /// Fresh, isolated context.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            capsules: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            reporter: ErrorReporter::new(),
            pauses: Arc::new(PauseRegistry::new()),
        })
    }

    /// The process-wide default context.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(Self::new))
    }

    /// The error reporter shared by this context's capsules.
    #[must_use]
    pub const fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Install the hook receiving every unresolved error.
    pub fn set_error_hook(&self, hook: impl Fn(&EngineError) + Send + Sync + 'static) {
        self.reporter.set_hook(hook);
    }

    /// Shared pause registry.
    #[must_use]
    pub const fn pauses(&self) -> &Arc<PauseRegistry> {
        &self.pauses
    }

    /// Exclude `scope` from future claims.
    pub fn pause(&self, scope: PauseScope) -> bool {
        self.pauses.pause(scope)
    }

    /// Make `scope` claimable again.
    pub fn unpause(&self, scope: &PauseScope) -> bool {
        self.pauses.unpause(scope)
    }

    /// Whether `scope` is paused.
    #[must_use]
    pub fn is_paused(&self, scope: &PauseScope) -> bool {
        self.pauses.is_paused(scope)
    }

    /// Live capsules.
    #[must_use]
    pub fn capsules(&self) -> Vec<Capsule> {
        self.capsules
            .lock()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .map(|inner| Capsule { inner })
            .collect()
    }

    /// Shut down every live capsule within one shared budget.
    pub fn shutdown(&self, timeout: ShutdownTimeout) {
        let capsules = self.capsules();
        let members: Vec<&dyn Lifecycle> = capsules.iter().map(|c| c as &dyn Lifecycle).collect();
        info!(capsules = members.len(), ?timeout, "shutting down all capsules");
        shutdown_all(&members, timeout);
    }

    /// Shut down, then start every live capsule again.
    ///
    /// # Errors
    ///
    /// The first capsule that fails to start.
    pub fn restart(&self, timeout: ShutdownTimeout) -> Result<(), EngineError> {
        self.shutdown(timeout);
        self.capsules().iter().try_for_each(Capsule::start)
    }

    /// Whether every live capsule is fully stopped.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.capsules().iter().all(Lifecycle::is_shutdown)
    }

    fn register(&self, inner: &Arc<CapsuleInner>) {
        let mut capsules = self.capsules.lock();
        capsules.retain(|(_, weak)| weak.strong_count() > 0);
        capsules.push((inner.id, Arc::downgrade(inner)));
    }

    fn deregister(&self, id: u64) {
        self.capsules.lock().retain(|(existing, _)| *existing != id);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("capsules", &self.capsules.lock().len())
            .field("paused", &self.pauses.snapshot())
            .finish_non_exhaustive()
    }
}

/// Components assembled by [`CapsuleBuilder`](crate::builders::CapsuleBuilder).
pub(crate) struct CapsuleParts {
    pub context: Arc<EngineContext>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<JobRegistry>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub schedulers: Arc<MultiScheduler>,
    pub notifier: Option<Notifier>,
    pub poller: Poller,
    pub cron: Option<CronManager>,
    pub cron_enabled: bool,
    pub enqueuer: Enqueuer,
    pub claim_lookahead: usize,
    pub shutdown_timeout: ShutdownTimeout,
}

struct CapsuleInner {
    id: u64,
    parts: CapsuleParts,
}

impl Drop for CapsuleInner {
    fn drop(&mut self) {
        self.parts.context.deregister(self.id);
        let members = self.parts.members();
        shutdown_all(&members, ShutdownTimeout::NoWait);
    }
}

impl CapsuleParts {
    fn members(&self) -> Vec<&dyn Lifecycle> {
        let mut members: Vec<&dyn Lifecycle> = Vec::with_capacity(4);
        if let Some(notifier) = &self.notifier {
            members.push(notifier);
        }
        members.push(&self.poller);
        if let Some(cron) = &self.cron {
            members.push(cron);
        }
        members.push(self.schedulers.as_ref());
        members
    }
}

/// Statistics for one capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleStats {
    /// Per-scheduler statistics.
    pub schedulers: Vec<SchedulerStats>,
    /// Whether the notifier holds a subscription.
    pub notifier_listening: bool,
    /// Poller ticks so far.
    pub poller_ticks: u64,
    /// Cron rows inserted so far.
    pub cron_enqueued: u64,
}

/// One start/shutdown/restart unit of the engine.
#[derive(Clone)]
pub struct Capsule {
    inner: Arc<CapsuleInner>,
}

impl Capsule {
    pub(crate) fn assemble(parts: CapsuleParts) -> Self {
        let id = parts.context.next_id();
        let inner = Arc::new(CapsuleInner { id, parts });
        inner.parts.context.register(&inner);
        Self { inner }
    }

    fn parts(&self) -> &CapsuleParts {
        &self.inner.parts
    }

    /// Start schedulers, then wake-up sources and cron.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if a thread cannot be created.
    pub fn start(&self) -> Result<(), EngineError> {
        let parts = self.parts();
        parts.schedulers.start()?;
        if let Some(notifier) = &parts.notifier {
            notifier.start()?;
        }
        parts.poller.start()?;
        if let (Some(cron), true) = (&parts.cron, parts.cron_enabled) {
            cron.start()?;
        }
        info!(
            capsule = self.inner.id,
            schedulers = parts.schedulers.schedulers().len(),
            listen_notify = parts.notifier.is_some(),
            poll_interval = ?parts.poller.interval(),
            cron = parts.cron_enabled,
            "capsule started"
        );
        Ok(())
    }

    /// Shut down every component within one budget.
    pub fn shutdown(&self, timeout: ShutdownTimeout) {
        shutdown_all(&self.parts().members(), timeout);
    }

    /// Shut down with the configured default timeout.
    pub fn shutdown_default(&self) {
        self.shutdown(self.parts().shutdown_timeout);
    }

    /// Shut down, then start again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if a thread cannot be created.
    pub fn restart(&self, timeout: ShutdownTimeout) -> Result<(), EngineError> {
        self.shutdown(timeout);
        self.start()
    }

    /// Whether any scheduler is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.parts().schedulers.is_running()
    }

    /// Wake schedulers for `hint`.
    pub fn create_thread(&self, hint: Option<&WakeHint>) -> bool {
        self.parts().schedulers.create_thread(hint)
    }

    /// The enqueuer bound to this capsule's store.
    #[must_use]
    pub fn enqueuer(&self) -> &Enqueuer {
        &self.parts().enqueuer
    }

    /// Enqueue `job`. Without a listening notifier the local schedulers are
    /// woken directly.
    ///
    /// # Errors
    ///
    /// Propagates insert failures.
    pub fn enqueue(&self, job: NewJob) -> Result<InsertOutcome, StoreError> {
        let hint = Enqueuer::hint_for(&job);
        let outcome = self.parts().enqueuer.enqueue(job)?;
        let listening = self.parts().notifier.as_ref().is_some_and(Notifier::is_listening);
        if matches!(outcome, InsertOutcome::Inserted(_)) && !listening {
            self.create_thread(Some(&hint));
        }
        Ok(outcome)
    }

    /// Drain up to `limit` jobs matching `queues` on the calling thread,
    /// returning the first unhandled job fault as an error.
    ///
    /// Must be called outside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Invalid queue string, store failure, or the first unhandled fault.
    pub fn perform_inline(&self, queues: &str, limit: Option<usize>) -> Result<usize, EngineError> {
        let parts = self.parts();
        let filter: QueueFilter = queues.parse()?;
        let performer = JobPerformer::new(
            filter,
            Arc::clone(&parts.store),
            Arc::clone(&parts.registry),
            Arc::clone(&parts.limiter),
            Arc::clone(parts.context.pauses()),
        )
        .with_lookahead(parts.claim_lookahead);
        perform_inline(&performer, limit)
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CapsuleStats {
        let parts = self.parts();
        CapsuleStats {
            schedulers: parts.schedulers.stats(),
            notifier_listening: parts.notifier.as_ref().is_some_and(Notifier::is_listening),
            poller_ticks: parts.poller.ticks(),
            cron_enqueued: parts.cron.as_ref().map_or(0, CronManager::enqueued),
        }
    }

    /// Schedulers.
    #[must_use]
    pub fn schedulers(&self) -> &MultiScheduler {
        &self.parts().schedulers
    }

    /// Notifier, when listen/notify is enabled and supported.
    #[must_use]
    pub fn notifier(&self) -> Option<&Notifier> {
        self.parts().notifier.as_ref()
    }

    /// Poller.
    #[must_use]
    pub fn poller(&self) -> &Poller {
        &self.parts().poller
    }

    /// Cron manager, when entries are configured.
    #[must_use]
    pub fn cron(&self) -> Option<&CronManager> {
        self.parts().cron.as_ref()
    }

    /// Concurrency limiter shared by this capsule's performers.
    #[must_use]
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.parts().limiter
    }

    /// Owning context.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.parts().context
    }
}

impl Lifecycle for Capsule {
    fn shutdown(&self, timeout: ShutdownTimeout) {
        Self::shutdown(self, timeout);
    }

    fn wait_for_termination(&self, deadline: Option<Instant>) -> bool {
        self.parts()
            .members()
            .iter()
            .fold(true, |all, m| m.wait_for_termination(deadline) && all)
    }

    fn is_shutdown(&self) -> bool {
        self.parts().members().iter().all(|m| m.is_shutdown())
    }
}

impl fmt::Debug for Capsule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capsule")
            .field("id", &self.inner.id)
            .field("schedulers", &self.parts().schedulers)
            .field("notifier", &self.parts().notifier)
            .field("poller", &self.parts().poller)
            .finish_non_exhaustive()
    }
}
