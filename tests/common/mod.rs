//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use prometheus_job_engine::builders::CapsuleBuilder;
use prometheus_job_engine::config::EngineConfig;
use prometheus_job_engine::core::{
    Capsule, EngineContext, JobArguments, JobRegistry, PerformError, Performable, RetryPolicy,
};
use prometheus_job_engine::infra::InMemoryStore;

/// Records the first positional argument of every run.
#[derive(Clone, Default)]
pub struct Recorder {
    pub ran: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn runs(&self) -> Vec<String> {
        self.ran.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.ran.lock().len()
    }
}

#[async_trait]
impl Performable for Recorder {
    async fn perform(&self, args: &JobArguments) -> Result<(), PerformError> {
        let label = args
            .args
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.ran.lock().push(label);
        Ok(())
    }
}

/// Sleeps for `duration`, tracking how many copies run at once.
#[derive(Clone)]
pub struct Sleeper {
    pub duration: Duration,
    pub started: Option<Sender<()>>,
    pub running: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub finished: Arc<AtomicUsize>,
}

impl Sleeper {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: None,
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn notifying(mut self, started: Sender<()>) -> Self {
        self.started = Some(started);
        self
    }
}

#[async_trait]
impl Performable for Sleeper {
    async fn perform(&self, _args: &JobArguments) -> Result<(), PerformError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(started) = &self.started {
            let _ = started.send(());
        }
        tokio::time::sleep(self.duration).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails `failures` times, then succeeds.
pub struct Flaky {
    pub failures: usize,
    pub attempts: Arc<AtomicUsize>,
    pub policy: RetryPolicy,
}

#[async_trait]
impl Performable for Flaky {
    async fn perform(&self, _args: &JobArguments) -> Result<(), PerformError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(anyhow::anyhow!("attempt {} failed", attempt + 1).into());
        }
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }
}

/// Always panics.
pub struct Panicker;

#[async_trait]
impl Performable for Panicker {
    async fn perform(&self, _args: &JobArguments) -> Result<(), PerformError> {
        panic!("performable exploded");
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Configuration with fast polling and listen/notify as requested.
pub fn fast_config(listen_notify: bool) -> EngineConfig {
    EngineConfig {
        max_threads: 3,
        poll_interval_secs: 0.2,
        enable_listen_notify: listen_notify,
        listen_wait_ms: 50,
        reconnect_interval_ms: 50,
        ..EngineConfig::default()
    }
}

/// Capsule on `store` in a fresh context.
pub fn capsule(store: &InMemoryStore, registry: JobRegistry, config: EngineConfig) -> Capsule {
    CapsuleBuilder::new(EngineContext::new(), Arc::new(store.session()), registry)
        .config(config)
        .build()
        .expect("capsule builds")
}
