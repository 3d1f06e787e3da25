//! Pub/sub listener waking schedulers when work is enqueued.
//!
//! The listener runs on its own thread with a dedicated store connection.
//! Connection failures are retried after a jittered interval; while
//! disconnected the poller remains the only wake-up source.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::core::error::{EngineError, ErrorReporter, StoreError};
use crate::core::lifecycle::{Lifecycle, ShutdownTimeout, ThreadControl, ThreadSignals};
use crate::core::store::{Store, NOTIFY_CHANNEL};
use crate::core::wake::{WakeHint, WakeTarget};

/// Notifier tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierOptions {
    /// Channel to listen on.
    pub channel: String,
    /// Longest single blocking wait for a message; bounds stop latency.
    pub wait_interval: Duration,
    /// Pause before resubscribing after a failure.
    pub reconnect_interval: Duration,
    /// Consecutive connection errors before the error hook is notified.
    pub error_threshold: u32,
}

impl Default for NotifierOptions {
    fn default() -> Self {
        Self {
            channel: NOTIFY_CHANNEL.to_string(),
            wait_interval: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(5),
            error_threshold: 3,
        }
    }
}

/// Listener state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotifierState {
    /// No subscription.
    Disconnected = 0,
    /// Waiting for messages.
    Listening = 1,
    /// Dispatching a message to recipients.
    Delivering = 2,
    /// Thread exited.
    Stopped = 3,
}

impl NotifierState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Listening,
            2 => Self::Delivering,
            _ => Self::Stopped,
        }
    }
}

struct NotifierInner {
    options: NotifierOptions,
    store: Arc<dyn Store>,
    recipients: Vec<Arc<dyn WakeTarget>>,
    reporter: ErrorReporter,
    state: AtomicU8,
    control: ThreadControl,
    connection_errors: AtomicU32,
    delivered: AtomicU64,
}

/// Subscribes to the wake-up channel and forwards messages to recipients.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

impl Notifier {
    /// Notifier delivering to `recipients`. Call [`start`](Self::start) to listen.
    #[must_use]
    pub fn new(
        options: NotifierOptions,
        store: Arc<dyn Store>,
        recipients: Vec<Arc<dyn WakeTarget>>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                options,
                store,
                recipients,
                reporter,
                state: AtomicU8::new(NotifierState::Stopped as u8),
                control: ThreadControl::new(),
                connection_errors: AtomicU32::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the listener thread. No-op if already started.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), EngineError> {
        let Some(signals) = self.inner.control.arm() else {
            return Ok(());
        };
        self.inner.set_state(NotifierState::Disconnected);
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("job-notifier".to_string())
            .spawn(move || inner.run(signals))?;
        Ok(())
    }

    /// Stop listening. Only `Forever` and `Within` wait for the thread.
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

    /// Shut down, then start listening again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Spawn`] if the thread cannot be created.
    pub fn restart(&self, timeout: ShutdownTimeout) -> Result<(), EngineError> {
        self.shutdown(timeout);
        self.start()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> NotifierState {
        self.inner.state()
    }

    /// Whether a subscription is active.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        matches!(
            self.state(),
            NotifierState::Listening | NotifierState::Delivering
        )
    }

    /// Messages delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }
}

impl Lifecycle for Notifier {
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

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("channel", &self.inner.options.channel)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn stopped(stop: &Receiver<()>) -> bool {
    matches!(stop.try_recv(), Err(TryRecvError::Disconnected))
}

impl NotifierInner {
    fn state(&self) -> NotifierState {
        NotifierState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: NotifierState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn run(&self, signals: ThreadSignals) {
        let ThreadSignals { stop, done } = signals;
        let channel = self.options.channel.as_str();

        while !stopped(&stop) {
            self.set_state(NotifierState::Disconnected);
            let mut subscription = match self.store.listen(channel) {
                Ok(subscription) => subscription,
                Err(error) => {
                    self.connection_failed(error);
                    if self.backoff(&stop) {
                        break;
                    }
                    continue;
                }
            };
            if self.connection_errors.swap(0, Ordering::AcqRel) > 0 {
                info!(channel, "notifier reconnected");
            } else {
                info!(channel, "notifier listening");
            }
            self.set_state(NotifierState::Listening);

            while !stopped(&stop) {
                match subscription.next_message(self.options.wait_interval) {
                    Ok(Some(payload)) => self.deliver(&payload),
                    Ok(None) => {}
                    Err(error) => {
                        self.connection_failed(error);
                        break;
                    }
                }
            }
        }

        self.set_state(NotifierState::Stopped);
        debug!(channel, "notifier stopped");
        drop(done);
    }

    fn deliver(&self, payload: &str) {
        self.set_state(NotifierState::Delivering);
        let hint = WakeHint::from_payload(payload);
        if hint.is_none() {
            debug!(payload, "unrecognised wake-up payload; waking all schedulers");
        }
        for recipient in &self.recipients {
            recipient.create_thread(hint.as_ref());
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.set_state(NotifierState::Listening);
    }

    fn connection_failed(&self, error: StoreError) {
        self.set_state(NotifierState::Disconnected);
        let count = self.connection_errors.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(channel = %self.options.channel, error = %error, count, "notifier connection error");
        if count == self.options.error_threshold {
            self.reporter.report(&EngineError::Store(error));
        }
    }

    /// Sleep the jittered reconnect interval; true if stopped meanwhile.
    fn backoff(&self, stop: &Receiver<()>) -> bool {
        let base = self.options.reconnect_interval;
        let wait = base.mul_f64(1.0 + rand::rng().random_range(0.0..0.2));
        matches!(stop.recv_timeout(wait), Err(RecvTimeoutError::Disconnected))
    }
}
