mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::test_helpers::{browser_request, classified, flat_config, harness, starter, tenant_request};
use futures::future::join_all;
use tollgate::rate_limit::TokenBucket;
use tollgate::{AlgorithmBank, Clock, EnqueueOutcome, ManualClock, MemoryStore, Priority, Scope};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn token_bucket_never_over_admits() {
    let clock = ManualClock::new(common::test_helpers::SATURDAY_NIGHT);
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let bank = Arc::new(AlgorithmBank::new(store));
    let now = clock.now_millis();

    let tasks = (0..64).map(|_| {
        let bank = bank.clone();
        tokio::spawn(async move {
            let bucket = TokenBucket { capacity: 20.0, cost: 1.0 };
            bank.evaluate(Scope::User, "user:shared", &bucket, now).await.allowed
        })
    });
    let allowed = join_all(tasks).await.into_iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(allowed, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_respect_user_capacity() {
    let h = harness(flat_config(20.0, 100.0), vec![]);
    let req = Arc::new(browser_request("/dashboard", "sk_parallel"));

    let tasks = (0..64).map(|_| {
        let controller = h.controller.clone();
        let req = req.clone();
        tokio::spawn(async move { controller.admit(&req).await.unwrap() })
    });
    let decisions: Vec<_> = join_all(tasks).await.into_iter().map(Result::unwrap).collect();

    let user_allowed = decisions.iter().filter(|d| d.scopes[0].allowed).count();
    let admitted = decisions.iter().filter(|d| d.allowed).count();
    assert_eq!(user_allowed, 20);
    assert!(admitted <= 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueues_stop_at_occupancy_limit() {
    // Starter queue capacity 10 with an occupancy limit of 0.8.
    let h = harness(flat_config(100.0, 20.0), vec![starter()]);
    let req = Arc::new(tenant_request("/api/orders", "sk_acme", "acme"));
    let entry = Arc::new(classified("key:acme", &starter(), Priority::Medium));

    let tasks = (0..32).map(|_| {
        let controller = h.controller.clone();
        let req = req.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            controller.queue().enqueue(&entry, "acme", &req, 10).await.unwrap()
        })
    });
    let outcomes: Vec<EnqueueOutcome> =
        join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();
    let queued = outcomes.iter().filter(|o| matches!(o, EnqueueOutcome::Queued { .. })).count();
    assert_eq!(queued, 8);
    assert_eq!(h.controller.queue().len("acme").await.unwrap(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_hand_out_each_entry_once() {
    let h = harness(flat_config(100.0, 20.0), vec![starter()]);
    let req = tenant_request("/api/orders", "sk_acme", "acme");
    let entry = classified("key:acme", &starter(), Priority::Medium);
    for _ in 0..30 {
        h.controller.queue().enqueue(&entry, "acme", &req, 100).await.unwrap();
    }

    let tasks = (0..4).map(|_| {
        let controller = h.controller.clone();
        tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                let claim = controller.queue().claim("acme", 5).await.unwrap();
                if claim.entries.is_empty() {
                    break ids;
                }
                for claimed in &claim.entries {
                    controller.queue().ack(claimed).await.unwrap();
                }
                ids.extend(claim.entries.into_iter().map(|c| c.entry.id));
            }
        })
    });
    let all: Vec<String> =
        join_all(tasks).await.into_iter().flat_map(|r| r.unwrap()).collect();
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 30);
    assert_eq!(unique.len(), 30);
}
