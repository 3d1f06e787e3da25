//! Telemetry helpers for structured logging and tracing.
//!
//! Engine threads are named (`jobs-0-worker-1`, `job-notifier`, `job-cron`),
//! so the default subscriber prints thread names.

use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVES: &str = "prometheus_job_engine=info";

/// Initialize tracing with `RUST_LOG`, falling back to
/// [`DEFAULT_DIRECTIVES`]. No-op if a subscriber is already installed.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    install(filter);
}

/// Initialize tracing with explicit filter directives, ignoring `RUST_LOG`.
pub fn init_tracing_with(directives: &str) {
    install(EnvFilter::new(directives));
}

fn install(filter: EnvFilter) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
