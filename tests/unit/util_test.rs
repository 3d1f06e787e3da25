//! Tests for utility functions

use std::time::Duration;

use prometheus_job_engine::util::clock;

#[test]
fn test_now_ms_is_monotonic_enough() {
    let first = clock::now_ms();
    let second = clock::now_ms();
    assert!(second >= first);
    assert!(first > 1_600_000_000_000);
}

#[test]
fn test_add_and_sub_are_inverse() {
    let now = clock::now();
    let later = clock::add(now, Duration::from_secs(90));
    assert_eq!((later - now).num_seconds(), 90);
    assert_eq!(clock::sub(later, Duration::from_secs(90)), now);
}

#[test]
fn test_until_past_is_zero() {
    let past = clock::sub(clock::now(), Duration::from_secs(5));
    assert_eq!(clock::until(past), Duration::ZERO);

    let future = clock::add(clock::now(), Duration::from_secs(60));
    assert!(clock::until(future) > Duration::from_secs(50));
}

#[test]
fn test_init_tracing_is_idempotent() {
    prometheus_job_engine::util::init_tracing();
    prometheus_job_engine::util::init_tracing();
}

#[test]
fn test_init_tracing_with_explicit_directives() {
    prometheus_job_engine::util::init_tracing_with("prometheus_job_engine=debug");
    assert!(tracing::dispatcher::has_been_set());
}
