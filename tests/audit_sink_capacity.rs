use tollgate::{AuditEvent, AuditSink, BlockReason, MemoryAuditSink};

fn rejection(i: u64) -> AuditEvent {
    AuditEvent::AdmissionRejected {
        at_ms: i,
        client: format!("key:{i}"),
        tenant: None,
        path: "/api/orders".into(),
        reason: BlockReason::RateLimitExceeded,
        retry_after: 1,
    }
}

#[tokio::test]
async fn memory_audit_sink_enforces_capacity() {
    let capacity = 100;
    let sink = MemoryAuditSink::with_capacity(capacity);

    for i in 0..150 {
        sink.record(rejection(i)).await.unwrap();
    }

    let events = sink.events().await;
    assert_eq!(events.len(), capacity, "sink length should match capacity after overflow");
    assert_eq!(events.first().unwrap().at_ms(), 50, "oldest 50 entries are evicted");
    assert_eq!(events.last().unwrap().at_ms(), 149);
}

#[tokio::test]
async fn clones_share_one_buffer() {
    let sink = MemoryAuditSink::with_capacity(10);
    let other = sink.clone();
    sink.record(rejection(1)).await.unwrap();
    other.record(rejection(2)).await.unwrap();
    assert_eq!(sink.events().await.len(), 2);
    assert_eq!(other.events_of("admission_rejected").await.len(), 2);
    assert!(other.events_of("dead_letter").await.is_empty());
}
