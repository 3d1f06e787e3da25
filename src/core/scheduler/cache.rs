//! Bounded look-ahead of future-scheduled wake-ups.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::core::lifecycle::{ThreadControl, ThreadSignals};
use crate::core::wake::WakeHint;
use crate::util::clock;

const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Entries {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64)>>,
    hints: HashMap<u64, WakeHint>,
    seen: HashSet<(Option<String>, DateTime<Utc>)>,
    seq: u64,
}

impl Entries {
    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<WakeHint> {
        let mut due = Vec::new();
        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some(hint) = self.hints.remove(&seq) {
                self.seen.remove(&(hint.queue_name.clone(), at));
                due.push(hint);
            }
        }
        due
    }

    fn next_at(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.hints.clear();
        self.seen.clear();
    }
}

struct CacheShared {
    max: usize,
    entries: Mutex<Entries>,
    nudge_tx: Sender<()>,
    nudge_rx: Receiver<()>,
    control: ThreadControl,
}

/// Timer-driven buffer of wake-ups for work that becomes due later.
#[derive(Clone)]
pub(crate) struct WakeCache {
    shared: Arc<CacheShared>,
}

impl WakeCache {
    pub(crate) fn new(max: usize) -> Self {
        let (nudge_tx, nudge_rx) = bounded(1);
        Self {
            shared: Arc::new(CacheShared {
                max,
                entries: Mutex::new(Entries::default()),
                nudge_tx,
                nudge_rx,
                control: ThreadControl::new(),
            }),
        }
    }

    /// Buffer `hint` until its due time. Returns false when full, disabled,
    /// already buffered, or the hint has no due time.
    pub(crate) fn push(&self, hint: WakeHint) -> bool {
        let Some(at) = hint.scheduled_at else {
            return false;
        };
        if self.shared.max == 0 {
            return false;
        }
        let mut entries = self.shared.entries.lock();
        if entries.hints.len() >= self.shared.max {
            trace!(max = self.shared.max, "wake cache full");
            return false;
        }
        if !entries.seen.insert((hint.queue_name.clone(), at)) {
            return false;
        }
        let seq = entries.seq;
        entries.seq += 1;
        entries.heap.push(Reverse((at, seq)));
        entries.hints.insert(seq, hint);
        drop(entries);
        let _ = self.shared.nudge_tx.try_send(());
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.entries.lock().hints.len()
    }

    /// Start the timer thread; `fire` receives each hint once it is due.
    pub(crate) fn start(
        &self,
        name: &str,
        fire: impl Fn(WakeHint) + Send + 'static,
    ) -> Result<(), std::io::Error> {
        if self.shared.max == 0 {
            return Ok(());
        }
        let Some(signals) = self.shared.control.arm() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("{name}-cache"))
            .spawn(move || timer_loop(&shared, signals, &fire))?;
        Ok(())
    }

    /// Stop the timer and drop buffered hints.
    pub(crate) fn stop(&self) {
        self.shared.control.signal_stop();
        self.shared.entries.lock().clear();
    }

    pub(crate) fn wait(&self, deadline: Option<Instant>) -> bool {
        self.shared.control.wait(deadline)
    }
}

fn timer_loop(shared: &CacheShared, signals: ThreadSignals, fire: &dyn Fn(WakeHint)) {
    let ThreadSignals { stop, done } = signals;
    debug!("wake cache timer started");
    loop {
        let wait = shared
            .entries
            .lock()
            .next_at()
            .map_or(IDLE_WAIT, clock::until);
        let stopped = select! {
            recv(stop) -> _ => true,
            recv(shared.nudge_rx) -> _ => false,
            default(wait) => false,
        };
        if stopped {
            break;
        }
        let due = shared.entries.lock().pop_due(clock::now());
        for hint in due {
            fire(WakeHint {
                queue_name: hint.queue_name,
                scheduled_at: None,
            });
        }
    }
    debug!("wake cache timer stopped");
    drop(done);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_dedups_and_respects_bound() {
        let cache = WakeCache::new(2);
        let at = clock::add(clock::now(), Duration::from_secs(60));
        assert!(cache.push(WakeHint::queue("a").at(at)));
        assert!(!cache.push(WakeHint::queue("a").at(at)));
        assert!(!cache.push(WakeHint::queue("b")));
        assert!(cache.push(WakeHint::queue("b").at(at)));
        assert!(!cache.push(WakeHint::queue("c").at(at)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn fires_when_due() {
        let cache = WakeCache::new(10);
        let (tx, rx) = crossbeam_channel::unbounded();
        cache
            .start("test", move |hint| {
                let _ = tx.send(hint);
            })
            .unwrap();
        let at = clock::add(clock::now(), Duration::from_millis(100));
        assert!(cache.push(WakeHint::queue("mailers").at(at)));

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(fired, WakeHint::queue("mailers"));
        assert!(clock::now() >= at);

        cache.stop();
        assert!(cache.wait(Some(Instant::now() + Duration::from_secs(2))));
    }
}
