//! Fixed-interval wake-up fallback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick};
use tracing::{debug, info};

use crate::core::error::EngineError;
use crate::core::lifecycle::{Lifecycle, ShutdownTimeout, ThreadControl, ThreadSignals};
use crate::core::wake::WakeTarget;

struct PollerInner {
    interval: Option<Duration>,
    recipients: Vec<Arc<dyn WakeTarget>>,
    control: ThreadControl,
    ticks: AtomicU64,
}

/// Wakes every recipient on each tick, regardless of notifications.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    /// Poller ticking every `interval`; `None` disables it.
    #[must_use]
    pub fn new(interval: Option<Duration>, recipients: Vec<Arc<dyn WakeTarget>>) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                interval: interval.filter(|i| !i.is_zero()),
                recipients,
                control: ThreadControl::new(),
                ticks: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the timer thread. Ticks once immediately.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), EngineError> {
        let Some(interval) = self.inner.interval else {
            debug!("poller disabled");
            return Ok(());
        };
        let Some(signals) = self.inner.control.arm() else {
            return Ok(());
        };
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("job-poller".to_string())
            .spawn(move || inner.run(interval, signals))?;
        info!(interval_ms = interval.as_millis(), "poller started");
        Ok(())
    }

    /// Stop ticking. Only `Forever` and `Within` wait for the thread.
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

    /// Shut down, then start ticking again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if the thread cannot be created.
    pub fn restart(&self, timeout: ShutdownTimeout) -> Result<(), EngineError> {
        self.shutdown(timeout);
        self.start()
    }

    /// Configured interval.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.inner.interval
    }

    /// Ticks delivered so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    /// Whether the timer thread is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.control.is_running()
    }
}

impl Lifecycle for Poller {
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

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("interval", &self.inner.interval)
            .field("ticks", &self.ticks())
            .finish_non_exhaustive()
    }
}

impl PollerInner {
    fn run(&self, interval: Duration, signals: ThreadSignals) {
        let ThreadSignals { stop, done } = signals;
        let ticker = tick(interval);
        self.wake_all();
        loop {
            let stopped = select! {
                recv(stop) -> _ => true,
                recv(ticker) -> _ => false,
            };
            if stopped {
                break;
            }
            self.wake_all();
        }
        debug!("poller stopped");
        drop(done);
    }

    fn wake_all(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        for recipient in &self.recipients {
            recipient.create_thread(None);
        }
    }
}
