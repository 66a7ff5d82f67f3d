mod common;

use common::test_helpers::{
    breaker_harness, browser_request, flat_config, harness, starter, tenant_request,
};
use tollgate::{BlockReason, Scope, Tenant, ThreatLevel, Tier, TollgateConfig};

#[tokio::test]
async fn user_bucket_admits_capacity_then_reports_retry_after() {
    // Free tier, web category, low priority: capacity 100 tokens at 1 token each.
    let h = harness(flat_config(100.0, 20.0), vec![]);
    let req = browser_request("/dashboard", "sk_burst");

    for i in 0..100 {
        let decision = h.controller.admit(&req).await.unwrap();
        let user = &decision.scopes[0];
        assert_eq!(user.scope, Scope::User);
        assert!(user.allowed, "request {i} should pass the user bucket");
    }

    let decision = h.controller.admit(&req).await.unwrap();
    let user = &decision.scopes[0];
    assert!(!user.allowed);
    assert!(user.retry_after > 0);
    assert!(!decision.allowed);
    assert!(decision.retry_after >= user.retry_after);
    assert_eq!(decision.blocked_reason, Some(BlockReason::RateLimitExceeded));
}

#[tokio::test]
async fn endpoint_burst_window_caps_rapid_requests() {
    let h = harness(flat_config(100.0, 20.0), vec![]);
    let req = browser_request("/dashboard", "sk_rapid");

    let mut admitted = 0;
    for _ in 0..30 {
        if h.controller.admit(&req).await.unwrap().allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 20);
}

#[tokio::test]
async fn categories_share_one_user_bucket_capacity() {
    // Defaults weight web at 1.5 and security at 0.3; the user bucket stays at 100 for both.
    let h = harness(TollgateConfig::default(), vec![]);
    let mut web = None;
    for _ in 0..10 {
        web = Some(h.controller.admit(&browser_request("/dashboard", "sk_mixed")).await.unwrap());
    }
    let web = web.unwrap();
    assert_eq!(web.scopes[0].remaining, 90);

    let security = h.controller.admit(&browser_request("/security/keys", "sk_mixed")).await.unwrap();
    assert!(security.allowed);
    assert_eq!(security.scopes[0].limit, web.scopes[0].limit);
    assert!(security.scopes[2].limit < web.scopes[2].limit);

    let after = h.controller.admit(&browser_request("/dashboard", "sk_mixed")).await.unwrap();
    assert!(after.allowed);
    assert_eq!(after.scopes[0].remaining, 88);
}

#[tokio::test]
async fn one_clients_overage_leaves_the_endpoint_breaker_closed() {
    let h = breaker_harness(TollgateConfig::default(), vec![]);
    let spam = browser_request("/api/items", "sk_spammer");

    let mut admitted = 0;
    for _ in 0..60 {
        let decision = h.controller.admit(&spam).await.unwrap();
        assert_ne!(decision.blocked_reason, Some(BlockReason::CircuitBreakerOpen));
        if decision.allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 20);

    let other = h.controller.admit(&browser_request("/api/items", "sk_bystander")).await.unwrap();
    assert!(other.allowed);
    assert_eq!(other.blocked_reason, None);
}

#[tokio::test]
async fn global_saturation_opens_the_endpoint_breaker() {
    let mut cfg = TollgateConfig::default();
    cfg.scopes.global_requests_per_minute = 10.0;
    let h = breaker_harness(cfg, vec![]);

    // 10 admissions, then global denials until half of at least 20 calls failed.
    for i in 0..20 {
        let req = browser_request("/api/items", &format!("sk_{i}"));
        let decision = h.controller.admit(&req).await.unwrap();
        assert_eq!(decision.allowed, i < 10);
    }

    let next = h.controller.admit(&browser_request("/api/items", "sk_late")).await.unwrap();
    assert_eq!(next.blocked_reason, Some(BlockReason::CircuitBreakerOpen));
    assert_eq!(next.retry_after, 30);
    let web = h.controller.admit(&browser_request("/dashboard", "sk_late")).await.unwrap();
    assert_ne!(web.blocked_reason, Some(BlockReason::CircuitBreakerOpen));
}

#[tokio::test]
async fn tenant_queue_fills_to_occupancy_limit_then_rejects() {
    // Starter: rpm 1, queue capacity 10, so deferral stops at 8 entries.
    let h = harness(flat_config(0.2, 10.0), vec![starter()]);
    let req = tenant_request("/api/orders", "sk_acme", "acme");

    let first = h.controller.admit(&req).await.unwrap();
    assert!(first.allowed);

    for expected in 1..=8 {
        let decision = h.controller.admit(&req).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.queued);
        assert_eq!(decision.queue_position, Some(expected));
        assert_eq!(decision.estimated_wait_seconds, Some(1));
        assert_eq!(decision.tenant_id.as_deref(), Some("acme"));
    }

    let full = h.controller.admit(&req).await.unwrap();
    assert!(!full.queued);
    assert_eq!(full.blocked_reason, Some(BlockReason::QueueFull));
    assert_eq!(h.controller.queue().len("acme").await.unwrap(), 8);
    assert_eq!(h.audit.events_of("admission_rejected").await.len(), 1);
}

#[tokio::test]
async fn disabled_queue_rejects_tenant_requests_outright() {
    let mut cfg = flat_config(0.2, 10.0);
    cfg.queue.enabled = false;
    let h = harness(cfg, vec![starter()]);
    let req = tenant_request("/api/orders", "sk_acme", "acme");

    assert!(h.controller.admit(&req).await.unwrap().allowed);
    let denied = h.controller.admit(&req).await.unwrap();
    assert!(!denied.queued);
    assert_eq!(denied.blocked_reason, Some(BlockReason::RateLimitExceeded));
    assert_eq!(h.controller.queue().len("acme").await.unwrap(), 0);
}

#[tokio::test]
async fn brute_force_triggers_cooldown_for_the_client() {
    let h = harness(TollgateConfig::default(), vec![]);
    let login = browser_request("/auth/login", "sk_guess");
    let ip = login.ip.unwrap();

    for _ in 0..11 {
        h.controller.record_auth_failure(ip).await.unwrap();
    }

    let blocked = h.controller.admit(&login).await.unwrap();
    assert!(!blocked.allowed);
    assert_eq!(blocked.threat_level, ThreatLevel::High);
    assert_eq!(blocked.blocked_reason, Some(BlockReason::ThreatDetected));
    assert_eq!(blocked.retry_after, 900);
    assert_eq!(h.audit.events_of("threat_detected").await.len(), 1);

    h.clock.advance(60_000);
    let later = h.controller.admit(&browser_request("/dashboard", "sk_guess")).await.unwrap();
    assert_eq!(later.blocked_reason, Some(BlockReason::ClientBlocked));
    assert_eq!(later.retry_after, 840);

    h.clock.advance(841_000);
    let released = h.controller.admit(&browser_request("/dashboard", "sk_guess")).await.unwrap();
    assert!(released.allowed);
}

#[tokio::test]
async fn tenant_resolves_from_host_domain() {
    let tenant = Tenant::new("globex", Tier::Professional).with_domain("globex.example");
    let h = harness(TollgateConfig::default(), vec![tenant]);
    let mut req = browser_request("/api/reports", "sk_globex");
    req.host = Some("GLOBEX.example:443".into());

    let decision = h.controller.admit(&req).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.tenant_id.as_deref(), Some("globex"));
    assert_eq!(decision.scopes[1].scope, Scope::Organization);
    assert!(decision.scopes[1].limit > 0);
}

#[tokio::test]
async fn unknown_tenant_header_is_treated_as_anonymous() {
    let h = harness(TollgateConfig::default(), vec![starter()]);
    let req = tenant_request("/api/orders", "sk_ghost", "initech");

    let decision = h.controller.admit(&req).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.tenant_id, None);
}
