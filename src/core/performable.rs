//! The unit of work the engine invokes, and the registry resolving job
//! classes to it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::core::error::PerformError;
use crate::core::job::JobArguments;

/// Work invoked for a job class.
///
/// Invocations must be safe to repeat; the engine delivers at least once.
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_job_engine::core::{JobArguments, Performable, PerformError};
///
/// struct SendDigest;
///
/// #[async_trait]
/// impl Performable for SendDigest {
///     async fn perform(&self, args: &JobArguments) -> Result<(), PerformError> {
///         let user = args.kwargs.get("user_id").ok_or_else(|| {
///             PerformError::Discard("missing user_id".into())
///         })?;
///         deliver(user).await.map_err(PerformError::from)
///     }
/// }
/// ```
#[async_trait]
pub trait Performable: Send + Sync + 'static {
    /// Run the job.
    async fn perform(&self, args: &JobArguments) -> Result<(), PerformError>;

    /// Retry behaviour for [`PerformError::Failed`]. Defaults to no retries.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    /// Per-class concurrency-key limit overriding configured limits.
    fn concurrency_limit(&self) -> Option<usize> {
        None
    }
}

/// Count-limited exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Random extra delay as a fraction of the computed delay.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Single attempt.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Up to `max_attempts` attempts starting at `base_delay`, capped at one hour.
    #[must_use]
    pub const fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(3600),
            jitter: 0.15,
        }
    }

    /// Set the jitter fraction.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether any retries are configured.
    #[must_use]
    pub const fn retries(&self) -> bool {
        self.max_attempts > 1
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.mul_f64(rand::rng().random_range(0.0..self.jitter));
        delay.saturating_add(extra).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Job class name to performable.
#[derive(Clone, Default)]
pub struct JobRegistry {
    classes: HashMap<String, Arc<dyn Performable>>,
}

impl JobRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `performable` under `job_class`.
    #[must_use]
    pub fn register(mut self, job_class: impl Into<String>, performable: impl Performable) -> Self {
        self.classes.insert(job_class.into(), Arc::new(performable));
        self
    }

    /// Register an already shared performable.
    #[must_use]
    pub fn register_arc(
        mut self,
        job_class: impl Into<String>,
        performable: Arc<dyn Performable>,
    ) -> Self {
        self.classes.insert(job_class.into(), performable);
        self
    }

    /// Look up a job class.
    #[must_use]
    pub fn get(&self, job_class: &str) -> Option<Arc<dyn Performable>> {
        self.classes.get(job_class).cloned()
    }

    /// Whether `job_class` is registered.
    #[must_use]
    pub fn contains(&self, job_class: &str) -> bool {
        self.classes.contains_key(job_class)
    }

    /// Registered class names.
    #[must_use]
    pub fn classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(10)).with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_secs(10));
            assert!(delay < Duration::from_secs(15));
        }
    }

    #[test]
    fn default_policy_never_retries() {
        assert!(!RetryPolicy::default().retries());
        assert!(!RetryPolicy::default().should_retry(1));
    }
}
