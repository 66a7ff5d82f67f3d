mod common;

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::test_helpers::{classified, flat_config, harness, starter, tenant_request};
use tokio_util::sync::CancellationToken;
use tollgate::queue::FailOutcome;
use tollgate::{
    AuditEvent, EnqueueOutcome, Executor, Priority, QueueOutcomeKind, ReplayRequest,
    ReplayResponse, ServiceExecutor, TollgateConfig,
};

fn recording_executor(status: u16, seen: Arc<Mutex<Vec<ReplayRequest>>>) -> Arc<dyn Executor> {
    Arc::new(ServiceExecutor::new(tower::service_fn(move |req: ReplayRequest| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(req);
            Ok::<_, Infallible>(ReplayResponse::new(status))
        }
    })))
}

#[tokio::test]
async fn claims_follow_priority_then_age_with_retry_penalty() {
    let h = harness(TollgateConfig::default(), vec![starter()]);
    let queue = h.controller.queue();
    let req = tenant_request("/api/orders", "sk_acme", "acme");
    let tenant = starter();

    let mut ids = Vec::new();
    for (client, priority) in [
        ("key:a", Priority::Low),
        ("key:b", Priority::High),
        ("key:c", Priority::Medium),
        ("key:d", Priority::High),
    ] {
        let entry = classified(client, &tenant, priority);
        match queue.enqueue(&entry, "acme", &req, 100).await.unwrap() {
            EnqueueOutcome::Queued { id, .. } => ids.push(id),
            other => panic!("expected queued, got {other:?}"),
        }
        h.clock.advance(1);
    }

    let claim = queue.claim("acme", 1).await.unwrap();
    assert_eq!(claim.entries.len(), 1);
    let first = claim.entries.into_iter().next().unwrap();
    assert_eq!(first.entry.client_id, "key:b");

    // One failure costs one priority level: b now ties with c and wins on age.
    let outcome = queue.fail(first, "upstream 503".into()).await.unwrap();
    assert!(matches!(outcome, FailOutcome::Retried { ref entry, .. } if entry.retry_count == 1));

    let order: Vec<String> =
        queue.pending("acme").await.unwrap().into_iter().map(|e| e.client_id).collect();
    assert_eq!(order, ["key:d", "key:b", "key:c", "key:a"]);

    // The retried entry waits out its backoff.
    let due: Vec<String> = queue
        .claim("acme", 10)
        .await
        .unwrap()
        .entries
        .into_iter()
        .map(|c| c.entry.client_id)
        .collect();
    assert_eq!(due, ["key:d", "key:c", "key:a"]);
}

#[tokio::test]
async fn deferred_request_is_replayed_with_its_body() {
    let h = harness(flat_config(0.2, 10.0), vec![starter()]);
    let mut req = tenant_request("/api/orders?draft=1", "sk_acme", "acme");
    req.method = "POST".into();
    req.body = Some(b"{\"sku\":42}".to_vec());

    assert!(h.controller.admit(&req).await.unwrap().allowed);
    let deferred = h.controller.admit(&req).await.unwrap();
    assert!(deferred.queued);

    h.clock.advance(1_500);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = h.controller.processor(recording_executor(201, seen.clone()));
    let report = processor.run_once().await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.tenants_drained, 1);

    let replayed = seen.lock().unwrap().clone();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].method, "POST");
    assert_eq!(replayed[0].path, "/api/orders?draft=1");
    assert_eq!(replayed[0].body.as_deref(), Some(&b"{\"sku\":42}"[..]));
    assert_eq!(replayed[0].tenant_id, "acme");
    assert_eq!(replayed[0].attempt, 0);

    assert_eq!(h.controller.queue().len("acme").await.unwrap(), 0);
    let stat = processor.wait_statistic().await.unwrap().expect("wait recorded");
    assert_eq!(stat.count, 1);

    let outcomes = h.audit.events_of("queue_outcome").await;
    assert!(matches!(
        outcomes.as_slice(),
        [AuditEvent::QueueOutcome { outcome: QueueOutcomeKind::Completed, wait_ms: 1_500, .. }]
    ));
}

#[tokio::test]
async fn failing_replays_dead_letter_exactly_once() {
    let h = harness(TollgateConfig::default(), vec![starter()]);
    let req = tenant_request("/api/orders", "sk_acme", "acme");
    let entry = classified("key:acme", &starter(), Priority::Medium);
    h.controller.queue().enqueue(&entry, "acme", &req, 10).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = h.controller.processor(recording_executor(503, seen.clone()));

    let mut dead = 0;
    let mut retried = 0;
    for _ in 0..5 {
        let report = processor.run_once().await;
        dead += report.dead_lettered;
        retried += report.retried;
        h.clock.advance(30_000);
    }

    assert_eq!(retried, 2);
    assert_eq!(dead, 1);
    let attempts: Vec<u32> = seen.lock().unwrap().iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, [0, 1, 2]);
    assert_eq!(h.controller.queue().len("acme").await.unwrap(), 0);

    let letters = h.audit.events_of("dead_letter").await;
    assert_eq!(letters.len(), 1);
    match &letters[0] {
        AuditEvent::DeadLetter { retry_count, error, .. } => {
            assert_eq!(*retry_count, 3);
            assert!(error.contains("503"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn sweep_removes_expired_entries_once() {
    let h = harness(TollgateConfig::default(), vec![starter()]);
    let req = tenant_request("/api/orders", "sk_acme", "acme");
    let entry = classified("key:acme", &starter(), Priority::Medium);
    h.controller.queue().enqueue(&entry, "acme", &req, 10).await.unwrap();
    h.clock.advance(200_000);
    h.controller.queue().enqueue(&entry, "acme", &req, 10).await.unwrap();
    h.clock.advance(150_000);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = h.controller.processor(recording_executor(200, seen));
    let first = processor.sweep().await;
    assert_eq!(first.expired, 1);
    assert_eq!(first.removed(), 1);
    assert_eq!(h.controller.queue().len("acme").await.unwrap(), 1);

    let second = processor.sweep().await;
    assert_eq!(second.removed(), 0);
    assert_eq!(h.audit.events_of("queue_outcome").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn spawned_processor_drains_until_cancelled() {
    let h = harness(TollgateConfig::default(), vec![starter()]);
    let req = tenant_request("/api/orders", "sk_acme", "acme");
    let entry = classified("key:acme", &starter(), Priority::Medium);
    for _ in 0..3 {
        h.controller.queue().enqueue(&entry, "acme", &req, 10).await.unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor =
        Arc::new(h.controller.processor(recording_executor(200, seen.clone())));
    let token = CancellationToken::new();
    let (drain, sweep) = processor.spawn(token.clone());

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    token.cancel();

    let report = drain.await.unwrap();
    sweep.await.unwrap();
    assert_eq!(report.completed, 3);
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(h.controller.queue().len("acme").await.unwrap(), 0);
}
