//! Tests for configuration validation

use std::collections::HashMap;
use std::time::Duration;

use prometheus_job_engine::config::{EngineConfig, ENV_PREFIX};
use prometheus_job_engine::core::{ConfigError, ShutdownTimeout};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), (*v).to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn test_json_config_with_defaults() {
    let cfg =
        EngineConfig::from_json_str(r#"{"queues": "mailers:2;*", "max_threads": 8}"#).unwrap();
    assert_eq!(cfg.max_threads, 8);
    assert_eq!(cfg.max_cache, 10_000);
    assert!(cfg.enable_listen_notify);
    assert!(!cfg.enable_cron);

    let pools = cfg.queue_pools().unwrap();
    assert_eq!(pools.len(), 2);
    assert_eq!(pools[0].max_threads, Some(2));
    assert_eq!(pools[1].max_threads, None);
}

#[test]
fn test_json_config_rejects_zero_threads() {
    let err = EngineConfig::from_json_str(r#"{"max_threads": 0}"#).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "max_threads"));
}

#[test]
fn test_json_config_rejects_malformed_input() {
    assert!(EngineConfig::from_json_str("{not json").is_err());
}

#[test]
fn test_json_config_validates_cron_entries() {
    let err = EngineConfig::from_json_str(
        r#"{"cron": {"broken": {"cron": "every fortnight-ish", "class": "Report"}}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidCron { key, .. } if key == "broken"));

    let cfg = EngineConfig::from_json_str(
        r#"{"enable_cron": true, "cron": {"hourly": {"cron": "@hourly", "class": "Report", "description": "roll up"}}}"#,
    )
    .unwrap();
    let entries = cfg.cron_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].description_text(), Some("roll up"));
}

#[test]
fn test_zero_concurrency_limit_is_rejected() {
    let err = EngineConfig::from_json_str(r#"{"concurrency_limits": {"tenant": 0}}"#).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidValue { field, .. } if field == "concurrency_limits.tenant"
    ));
}

#[test]
fn test_lookup_overrides_defaults() {
    let cfg = EngineConfig::from_lookup(lookup(&[
        ("QUEUES", "-slow"),
        ("MAX_THREADS", "3"),
        ("POLL_INTERVAL", "2.5"),
        ("ENABLE_LISTEN_NOTIFY", "false"),
        ("ENABLE_CRON", "yes"),
        ("SHUTDOWN_TIMEOUT", "30"),
        ("CRON_GRACEFUL_RESTART_PERIOD", "120"),
    ]))
    .unwrap();

    assert_eq!(cfg.queues, "-slow");
    assert_eq!(cfg.max_threads, 3);
    assert_eq!(cfg.poll_interval(), Some(Duration::from_millis(2_500)));
    assert!(!cfg.enable_listen_notify);
    assert!(cfg.enable_cron);
    assert_eq!(cfg.shutdown_timeout(), ShutdownTimeout::Within(Duration::from_secs(30)));
    assert_eq!(cfg.cron_graceful_restart_period(), Some(Duration::from_secs(120)));
}

#[test]
fn test_lookup_shutdown_timeout_tiers() {
    let tier = |value: &str| {
        EngineConfig::from_lookup(lookup(&[("SHUTDOWN_TIMEOUT", value)]))
            .unwrap()
            .shutdown_timeout()
    };
    assert_eq!(tier("none"), ShutdownTimeout::NoWait);
    assert_eq!(tier("-1"), ShutdownTimeout::Forever);
    assert_eq!(tier("0"), ShutdownTimeout::Immediate);
}

#[test]
fn test_lookup_rejects_garbage() {
    let err = EngineConfig::from_lookup(lookup(&[("MAX_THREADS", "lots")])).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidValue { field, .. } if field == "JOB_ENGINE_MAX_THREADS"
    ));

    assert!(EngineConfig::from_lookup(lookup(&[("ENABLE_CRON", "maybe")])).is_err());
    assert!(EngineConfig::from_lookup(lookup(&[("QUEUES", ";")])).is_err());
}

#[test]
fn test_lookup_reads_cron_json() {
    let cfg = EngineConfig::from_lookup(lookup(&[(
        "CRON",
        r#"{"sweep": {"cron": "*/10 * * * *", "class": "Sweep", "set": {"queue": "maintenance"}}}"#,
    )]))
    .unwrap();
    assert_eq!(cfg.cron["sweep"].set.queue.as_deref(), Some("maintenance"));
}
