//! Fan-out over several schedulers acting as one.

use std::time::Instant;

use crate::core::error::EngineError;
use crate::core::lifecycle::{shutdown_all, Lifecycle, ShutdownTimeout};
use crate::core::scheduler::{Scheduler, SchedulerStats};
use crate::core::wake::{WakeHint, WakeTarget};

/// Several independently configured schedulers, e.g. one per queue pool.
#[derive(Debug, Clone, Default)]
pub struct MultiScheduler {
    schedulers: Vec<Scheduler>,
}

impl MultiScheduler {
    /// Group `schedulers`.
    #[must_use]
    pub const fn new(schedulers: Vec<Scheduler>) -> Self {
        Self { schedulers }
    }

    /// Members.
    #[must_use]
    pub fn schedulers(&self) -> &[Scheduler] {
        &self.schedulers
    }

    /// Start every member.
    ///
    /// # Errors
    ///
    /// The first member that fails to start.
    pub fn start(&self) -> Result<(), EngineError> {
        self.schedulers.iter().try_for_each(Scheduler::start)
    }

    /// With a hint, the first member accepting it gets the wake-up. Without
    /// one, every member is woken. Returns whether any thread started.
    pub fn create_thread(&self, hint: Option<&WakeHint>) -> bool {
        match hint {
            Some(hint) => self
                .schedulers
                .iter()
                .filter(|s| s.accepts(Some(hint)))
                .any(|s| s.create_thread(Some(hint))),
            None => self
                .schedulers
                .iter()
                .fold(false, |started, s| s.create_thread(None) || started),
        }
    }

    /// Shut down every member within one shared budget.
    pub fn shutdown(&self, timeout: ShutdownTimeout) {
        let members: Vec<&dyn Lifecycle> =
            self.schedulers.iter().map(|s| s as &dyn Lifecycle).collect();
        shutdown_all(&members, timeout);
    }

    /// Shut down, then start every member again.
    ///
    /// # Errors
    ///
    /// The first member that fails to start.
    pub fn restart(&self, timeout: ShutdownTimeout) -> Result<(), EngineError> {
        self.shutdown(timeout);
        self.start()
    }

    /// Per-member statistics.
    #[must_use]
    pub fn stats(&self) -> Vec<SchedulerStats> {
        self.schedulers.iter().map(Scheduler::stats).collect()
    }

    /// Whether any member is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.schedulers.iter().any(Scheduler::is_running)
    }
}

impl Lifecycle for MultiScheduler {
    fn shutdown(&self, timeout: ShutdownTimeout) {
        Self::shutdown(self, timeout);
    }

    fn wait_for_termination(&self, deadline: Option<Instant>) -> bool {
        self.schedulers
            .iter()
            .fold(true, |all, s| s.wait_for_termination(deadline) && all)
    }

    fn is_shutdown(&self) -> bool {
        self.schedulers.iter().all(Lifecycle::is_shutdown)
    }
}

impl WakeTarget for MultiScheduler {
    fn create_thread(&self, hint: Option<&WakeHint>) -> bool {
        Self::create_thread(self, hint)
    }
}
