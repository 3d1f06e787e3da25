//! Shutdown contract shared by every long-running component.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// How long a shutdown may wait for in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTimeout {
    /// Signal and return without waiting.
    NoWait,
    /// Wait until everything in flight has finished.
    Forever,
    /// Cancel in-flight work now and wait for it to wind down.
    Immediate,
    /// Wait up to the duration, then cancel what remains.
    Within(Duration),
}

impl ShutdownTimeout {
    /// Map the seconds convention: `None` no wait, negative forever, zero
    /// immediate, positive a bounded wait.
    #[must_use]
    pub fn from_seconds(seconds: Option<f64>) -> Self {
        match seconds {
            None => Self::NoWait,
            Some(s) if s < 0.0 => Self::Forever,
            Some(s) if s == 0.0 || !s.is_finite() => Self::Immediate,
            Some(s) => Self::Within(Duration::from_secs_f64(s)),
        }
    }

    /// Deadline for a bounded wait starting now.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Self::Within(duration) => Instant::now().checked_add(*duration),
            _ => None,
        }
    }
}

/// Component with the four-tier shutdown contract.
pub trait Lifecycle: Send + Sync {
    /// Stop accepting work and apply `timeout` to in-flight work.
    fn shutdown(&self, timeout: ShutdownTimeout);

    /// Block until in-flight work finished or `deadline` passed; `None`
    /// waits forever. Returns whether everything finished.
    fn wait_for_termination(&self, deadline: Option<Instant>) -> bool;

    /// Whether the component is fully stopped.
    fn is_shutdown(&self) -> bool;
}

/// Shut down many components with one budget: signal all, wait jointly for
/// the remaining time, then force whatever is left.
pub fn shutdown_all(components: &[&dyn Lifecycle], timeout: ShutdownTimeout) {
    match timeout {
        ShutdownTimeout::NoWait => {
            for component in components {
                component.shutdown(timeout);
            }
        }
        ShutdownTimeout::Immediate => {
            for component in components {
                component.shutdown(ShutdownTimeout::NoWait);
            }
            for component in components {
                component.shutdown(ShutdownTimeout::Immediate);
            }
        }
        ShutdownTimeout::Forever => {
            for component in components {
                component.shutdown(ShutdownTimeout::NoWait);
            }
            for component in components {
                component.wait_for_termination(None);
            }
        }
        ShutdownTimeout::Within(_) => {
            let deadline = timeout.deadline();
            for component in components {
                component.shutdown(ShutdownTimeout::NoWait);
            }
            for component in components {
                if !component.wait_for_termination(deadline) {
                    component.shutdown(ShutdownTimeout::Immediate);
                }
            }
        }
    }
}

/// Signals handed to a supervised thread.
pub(crate) struct ThreadSignals {
    /// Disconnects when the thread should stop.
    pub stop: Receiver<()>,
    /// Dropped by the thread on exit.
    pub done: Sender<()>,
}

struct ControlState {
    stop_tx: Option<Sender<()>>,
    done_rx: Option<Receiver<()>>,
}

/// Stop signal and termination tracking for one background thread.
///
/// Stopping drops the stop sender; the thread's receiver disconnects.
/// The thread holds the done sender, so a disconnected done receiver means
/// the thread has exited.
pub(crate) struct ThreadControl {
    state: Mutex<ControlState>,
}

impl ThreadControl {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                stop_tx: None,
                done_rx: None,
            }),
        }
    }

    /// Fresh signals for a new thread, or `None` if one is still armed.
    pub(crate) fn arm(&self) -> Option<ThreadSignals> {
        let mut state = self.state.lock();
        if state.stop_tx.is_some() {
            return None;
        }
        let (stop_tx, stop) = bounded::<()>(0);
        let (done, done_rx) = bounded::<()>(0);
        state.stop_tx = Some(stop_tx);
        state.done_rx = Some(done_rx);
        drop(state);
        Some(ThreadSignals { stop, done })
    }

    pub(crate) fn signal_stop(&self) {
        self.state.lock().stop_tx = None;
    }

    /// Whether a thread is armed and has not been told to stop.
    pub(crate) fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.stop_tx.is_some() && !Self::exited(state.done_rx.as_ref())
    }

    pub(crate) fn is_finished(&self) -> bool {
        Self::exited(self.state.lock().done_rx.as_ref())
    }

    /// Wait for the thread to exit; `None` waits forever.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> bool {
        let Some(done_rx) = self.state.lock().done_rx.clone() else {
            return true;
        };
        match deadline {
            None => done_rx.recv().is_err(),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                matches!(
                    done_rx.recv_timeout(remaining),
                    Err(RecvTimeoutError::Disconnected)
                )
            }
        }
    }

    fn exited(done_rx: Option<&Receiver<()>>) -> bool {
        done_rx.is_none_or(|rx| {
            matches!(
                rx.try_recv(),
                Err(crossbeam_channel::TryRecvError::Disconnected)
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn seconds_convention() {
        assert_eq!(ShutdownTimeout::from_seconds(None), ShutdownTimeout::NoWait);
        assert_eq!(ShutdownTimeout::from_seconds(Some(-1.0)), ShutdownTimeout::Forever);
        assert_eq!(ShutdownTimeout::from_seconds(Some(0.0)), ShutdownTimeout::Immediate);
        assert_eq!(
            ShutdownTimeout::from_seconds(Some(2.5)),
            ShutdownTimeout::Within(Duration::from_millis(2500))
        );
    }

    #[test]
    fn thread_control_tracks_exit() {
        let control = ThreadControl::new();
        let signals = control.arm().unwrap();
        assert!(control.arm().is_none());

        let handle = thread::spawn(move || {
            let ThreadSignals { stop, done } = signals;
            let _ = stop.recv();
            drop(done);
        });
        assert!(control.is_running());
        assert!(!control.wait(Some(Instant::now() + Duration::from_millis(20))));

        control.signal_stop();
        assert!(control.wait(None));
        assert!(control.is_finished());
        handle.join().unwrap();

        assert!(control.arm().is_some());
    }

    #[derive(Default)]
    struct Component {
        calls: Mutex<Vec<ShutdownTimeout>>,
        finishes: bool,
    }

    impl Lifecycle for Component {
        fn shutdown(&self, timeout: ShutdownTimeout) {
            self.calls.lock().push(timeout);
        }

        fn wait_for_termination(&self, _deadline: Option<Instant>) -> bool {
            self.finishes
        }

        fn is_shutdown(&self) -> bool {
            self.finishes
        }
    }

    #[test]
    fn immediate_stops_everyone_before_cancelling() {
        let a = Component::default();
        let b = Component::default();
        shutdown_all(&[&a, &b], ShutdownTimeout::Immediate);

        for component in [&a, &b] {
            assert_eq!(
                *component.calls.lock(),
                vec![ShutdownTimeout::NoWait, ShutdownTimeout::Immediate]
            );
        }
    }

    #[test]
    fn bounded_escalates_only_laggards() {
        let done = Component {
            finishes: true,
            ..Component::default()
        };
        let stuck = Component::default();
        shutdown_all(&[&done, &stuck], ShutdownTimeout::Within(Duration::from_millis(10)));

        assert_eq!(*done.calls.lock(), vec![ShutdownTimeout::NoWait]);
        assert_eq!(
            *stuck.calls.lock(),
            vec![ShutdownTimeout::NoWait, ShutdownTimeout::Immediate]
        );
    }
}
