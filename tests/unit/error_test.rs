//! Tests for error types and the error hook

use std::sync::Arc;

use parking_lot::Mutex;
use prometheus_job_engine::core::{
    ConfigError, EngineContext, EngineError, ErrorReporter, JobId, PerformError, StoreError,
    CANCEL_GRACE,
};

#[test]
fn test_store_error_display() {
    assert_eq!(
        StoreError::Connection("refused".into()).to_string(),
        "connection error: refused"
    );
    assert_eq!(StoreError::SubscriptionClosed.to_string(), "subscription closed");
}

#[test]
fn test_engine_error_wraps_sources() {
    let err: EngineError = StoreError::Backend("disk full".into()).into();
    assert_eq!(err.to_string(), "store error: backend error: disk full");

    let err: EngineError = ConfigError::DuplicateCronKey("nightly".into()).into();
    assert!(err.to_string().contains("duplicate cron entry key `nightly`"));
}

#[test]
fn test_job_failed_message_names_the_job() {
    let job_id = JobId::new();
    let err = EngineError::JobFailed {
        job_id,
        job_class: "Mailer".into(),
        message: "smtp down".into(),
    };
    let text = err.to_string();
    assert!(text.contains(&job_id.to_string()));
    assert!(text.contains("Mailer"));
    assert!(text.contains("smtp down"));
}

#[test]
fn test_perform_error_from_anyhow_is_transparent() {
    let err: PerformError = anyhow::anyhow!("upstream timeout").into();
    assert_eq!(err.to_string(), "upstream timeout");
    assert_eq!(PerformError::Interrupted.to_string(), "interrupted");
    assert_eq!(
        PerformError::Handled("used fallback".into()).to_string(),
        "handled: used fallback"
    );
}

#[test]
fn test_worker_stuck_names_scheduler_and_grace() {
    let err = EngineError::WorkerStuck {
        scheduler: "mailers".into(),
        grace: CANCEL_GRACE,
    };
    let text = err.to_string();
    assert!(text.contains("`mailers`"));
    assert!(text.contains("10s"));
}

#[test]
fn test_context_hook_receives_reported_errors() {
    let context = EngineContext::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    context.set_error_hook(move |error| sink.lock().push(error.to_string()));

    context
        .reporter()
        .report(&EngineError::WorkerPanic("worker exploded".into()));
    assert_eq!(seen.lock().as_slice(), ["worker panicked: worker exploded"]);
}

#[test]
fn test_reporter_without_hook_only_logs() {
    let reporter = ErrorReporter::new();
    reporter.report(&EngineError::WorkerPanic("nobody listens".into()));
    assert!(format!("{reporter:?}").contains("hook_installed: false"));
}
