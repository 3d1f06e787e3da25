//! Tests for capsule and scheduler builders

use std::sync::Arc;

use async_trait::async_trait;
use prometheus_job_engine::builders::{build_limiter, build_schedulers, CapsuleBuilder};
use prometheus_job_engine::config::EngineConfig;
use prometheus_job_engine::core::{
    ConfigError, CronEntry, EngineContext, EngineError, ErrorReporter, JobArguments, JobRegistry,
    PauseRegistry, PerformError, Performable, Store,
};
use prometheus_job_engine::infra::InMemoryStore;

struct Noop;

#[async_trait]
impl Performable for Noop {
    async fn perform(&self, _args: &JobArguments) -> Result<(), PerformError> {
        Ok(())
    }
}

fn store() -> Arc<dyn Store> {
    Arc::new(InMemoryStore::new())
}

#[test]
fn test_one_scheduler_per_queue_pool() {
    let cfg = EngineConfig {
        queues: "mailers:2;-mailers".to_string(),
        max_threads: 4,
        ..EngineConfig::default()
    };
    let multi = build_schedulers(
        &cfg,
        &store(),
        &Arc::new(JobRegistry::new()),
        &Arc::new(build_limiter(&cfg)),
        &Arc::new(PauseRegistry::new()),
        &ErrorReporter::new(),
        None,
    )
    .unwrap();

    let stats: Vec<_> = multi.stats();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].name, "jobs-0");
    assert_eq!(stats[0].max_threads, 2);
    assert_eq!(stats[1].max_threads, 4);
}

#[test]
fn test_limiter_uses_configured_limits() {
    let mut cfg = EngineConfig {
        default_concurrency_limit: 2,
        ..EngineConfig::default()
    };
    cfg.concurrency_limits.insert("exports".to_string(), 5);
    let limiter = build_limiter(&cfg);
    assert_eq!(limiter.limit_for("exports", None), 5);
    assert_eq!(limiter.limit_for("anything", None), 2);
}

#[test]
fn test_capsule_registers_with_its_context() {
    let context = EngineContext::new();
    let registry = JobRegistry::new().register("Noop", Noop);
    let capsule = CapsuleBuilder::new(Arc::clone(&context), store(), registry)
        .build()
        .unwrap();
    assert_eq!(context.capsules().len(), 1);
    assert!(capsule.notifier().is_some());
    assert!(capsule.cron().is_none());

    drop(capsule);
    assert!(context.capsules().is_empty());
}

#[test]
fn test_listen_notify_can_be_disabled() {
    let cfg = EngineConfig {
        enable_listen_notify: false,
        ..EngineConfig::default()
    };
    let capsule = CapsuleBuilder::new(EngineContext::new(), store(), JobRegistry::new())
        .config(cfg)
        .build()
        .unwrap();
    assert!(capsule.notifier().is_none());
}

#[test]
fn test_cron_entry_for_unknown_class_fails_fast() {
    let err = CapsuleBuilder::new(EngineContext::new(), store(), JobRegistry::new())
        .cron_entry(CronEntry::new("nightly", "0 3 * * *", "Missing").unwrap())
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Config(ConfigError::MissingTarget { key, .. }) if key == "nightly"
    ));
}

#[test]
fn test_duplicate_cron_keys_are_rejected() {
    let registry = JobRegistry::new().register("Noop", Noop);
    let err = CapsuleBuilder::new(EngineContext::new(), store(), registry)
        .cron_entry(CronEntry::new("tick", "* * * * *", "Noop").unwrap())
        .cron_entry(CronEntry::new("tick", "@hourly", "Noop").unwrap())
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Config(ConfigError::DuplicateCronKey(key)) if key == "tick"
    ));
}
