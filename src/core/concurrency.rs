//! Per-key execution caps, independent of store locks.
//!
//! The registry is process-local. Two processes each enforce their own
//! count, so a key limited to one may run once per process.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

use crate::core::job::JobId;

#[derive(Debug, Default)]
struct KeyState {
    running: usize,
    max: usize,
    waiting: VecDeque<JobId>,
}

/// In-process registry of running counts per concurrency key.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    default_limit: usize,
    limits: HashMap<String, usize>,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ConcurrencyLimiter {
    /// Limiter applying `default_limit` to keys without an explicit limit.
    #[must_use]
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit,
            limits: HashMap::new(),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Set a fixed limit for `key`.
    #[must_use]
    pub fn with_limit(mut self, key: impl Into<String>, max: usize) -> Self {
        self.limits.insert(key.into(), max);
        self
    }

    /// Effective limit: a performable override wins over configured limits.
    #[must_use]
    pub fn limit_for(&self, key: &str, performable_limit: Option<usize>) -> usize {
        performable_limit
            .or_else(|| self.limits.get(key).copied())
            .unwrap_or(self.default_limit)
    }

    /// Atomic check-and-increment. Never blocks.
    pub fn try_acquire(&self, key: &str, max: usize) -> bool {
        let mut keys = self.keys.lock();
        let state = keys.entry(key.to_string()).or_default();
        state.max = max;
        if state.running < max {
            state.running += 1;
            true
        } else {
            if state.running == 0 && state.waiting.is_empty() {
                keys.remove(key);
            }
            false
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), recording `job_id` as a
    /// waiter when the key is saturated.
    pub fn try_acquire_for(&self, key: &str, job_id: JobId, max: usize) -> bool {
        let mut keys = self.keys.lock();
        let state = keys.entry(key.to_string()).or_default();
        state.max = max;
        if state.running < max {
            state.running += 1;
            state.waiting.retain(|id| *id != job_id);
            true
        } else {
            if !state.waiting.contains(&job_id) {
                state.waiting.push_back(job_id);
            }
            debug!(
                key,
                job.id = %job_id,
                running = state.running,
                max,
                "concurrency key saturated"
            );
            false
        }
    }

    /// Release one slot. When the count reaches zero the entry is dropped
    /// and the oldest recorded waiter, if any, is returned.
    pub fn release(&self, key: &str) -> Option<JobId> {
        let mut keys = self.keys.lock();
        let state = keys.get_mut(key)?;
        state.running = state.running.saturating_sub(1);
        if state.running > 0 {
            return None;
        }
        keys.remove(key).and_then(|mut state| state.waiting.pop_front())
    }

    /// Currently executing jobs holding `key`.
    #[must_use]
    pub fn running(&self, key: &str) -> usize {
        self.keys.lock().get(key).map_or(0, |s| s.running)
    }

    /// Jobs recorded as blocked on `key`, oldest first.
    #[must_use]
    pub fn waiting(&self, key: &str) -> Vec<JobId> {
        self.keys
            .lock()
            .get(key)
            .map(|s| s.waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Keys with no free slot, excluded from claim queries.
    #[must_use]
    pub fn saturated_keys(&self) -> Vec<String> {
        self.keys
            .lock()
            .iter()
            .filter(|(_, s)| s.running > 0 && s.running >= s.max)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.keys.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn acquire_respects_max_and_cleans_up() {
        let limiter = ConcurrencyLimiter::default();
        assert!(limiter.try_acquire("account-1", 1));
        assert!(!limiter.try_acquire("account-1", 1));
        assert_eq!(limiter.saturated_keys(), vec!["account-1".to_string()]);

        assert_eq!(limiter.release("account-1"), None);
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(limiter.try_acquire("account-1", 1));
    }

    #[test]
    fn waiters_are_returned_oldest_first() {
        let limiter = ConcurrencyLimiter::default();
        let (a, b) = (JobId::new(), JobId::new());
        assert!(limiter.try_acquire("k", 1));
        assert!(!limiter.try_acquire_for("k", a, 1));
        assert!(!limiter.try_acquire_for("k", b, 1));
        assert!(!limiter.try_acquire_for("k", a, 1));
        assert_eq!(limiter.waiting("k"), vec![a, b]);
        assert_eq!(limiter.release("k"), Some(a));
    }

    #[test]
    fn limit_resolution_order() {
        let limiter = ConcurrencyLimiter::new(2).with_limit("reports", 4);
        assert_eq!(limiter.limit_for("reports", None), 4);
        assert_eq!(limiter.limit_for("reports", Some(1)), 1);
        assert_eq!(limiter.limit_for("other", None), 2);
    }

    #[test]
    fn concurrent_acquire_never_exceeds_max() {
        let limiter = Arc::new(ConcurrencyLimiter::default());
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let peak = Arc::clone(&peak);
                let active = Arc::clone(&active);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if limiter.try_acquire("shared", 1) {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            active.fetch_sub(1, Ordering::SeqCst);
                            limiter.release("shared");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
