//! Tests for queue filter strings

use prometheus_job_engine::core::{QueueFilter, WakeHint};

#[test]
fn test_wildcard_matches_everything() {
    let filter: QueueFilter = "*".parse().unwrap();
    assert!(filter.matches("default"));
    assert!(filter.matches("anything"));
    assert_eq!(filter, QueueFilter::All);
}

#[test]
fn test_exclusion_list() {
    let filter: QueueFilter = "-mailers,reports".parse().unwrap();
    assert!(filter.matches("default"));
    assert!(!filter.matches("mailers"));
    assert!(!filter.matches("reports"));
}

#[test]
fn test_prefix_patterns() {
    let filter: QueueFilter = "tenant_*".parse().unwrap();
    assert!(filter.matches("tenant_42"));
    assert!(!filter.matches("default"));
}

#[test]
fn test_rank_matches_prefix_patterns_and_ignores_exclusions() {
    let filter: QueueFilter = "+urgent,tenant_*".parse().unwrap();
    assert_eq!(filter.rank("tenant_7"), 1);
    assert_eq!("-urgent".parse::<QueueFilter>().unwrap().rank("default"), 0);
}

#[test]
fn test_hint_without_queue_matches_any_filter() {
    let filter: QueueFilter = "mailers".parse().unwrap();
    assert!(filter.matches_hint(None));
    assert!(filter.matches_hint(WakeHint::queue("mailers").queue_name.as_deref()));
    assert!(!filter.matches_hint(Some("reports")));
}
