//! Tests for the audit trail

use prometheus_job_engine::core::{
    build_audit_event, AuditSink, InMemoryAuditSink, JobRow, NewJob,
};
use prometheus_job_engine::util::clock;

#[test]
fn test_build_audit_event_copies_row_identity() {
    let row = JobRow::from_new(NewJob::new("Resize").queue("media"), clock::now());
    let event = build_audit_event(&row, "succeeded", None);
    assert_eq!(event.job_id, row.id);
    assert_eq!(event.queue, "media");
    assert_eq!(event.job_class, "Resize");
    assert_eq!(event.action, "succeeded");
    assert!(!event.event_id.is_empty());
}

#[test]
fn test_in_memory_sink_keeps_latest_events() {
    let sink = InMemoryAuditSink::new(3);
    let mut writer = sink.clone();
    let row = JobRow::from_new(NewJob::new("Resize"), clock::now());
    for attempt in 0..5 {
        writer.record(build_audit_event(&row, "retried", Some(format!("attempt {attempt}"))));
    }

    let details: Vec<_> = sink.events().into_iter().filter_map(|e| e.detail).collect();
    assert_eq!(details, ["attempt 2", "attempt 3", "attempt 4"]);
}

#[test]
fn test_zero_capacity_sink_stores_nothing() {
    let mut sink = InMemoryAuditSink::new(0);
    let row = JobRow::from_new(NewJob::new("Resize"), clock::now());
    sink.record(build_audit_event(&row, "failed", None));
    assert!(sink.events().is_empty());
}
