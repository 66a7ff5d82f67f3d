#![allow(dead_code)]

use std::sync::Arc;

use tollgate::{
    AdmissionController, CircuitBreaker, ClassifiedRequest, ClientIdentity, EndpointCategory,
    InMemoryTenantDirectory, ManualClock, MemoryAuditSink, MemoryStore, NoopCircuitBreaker,
    Priority, RequestDescriptor, Tenant, Tier, TollgateConfig,
};

/// 2024-01-06 23:00 UTC, a Saturday: no business-hours boost applies.
pub const SATURDAY_NIGHT: u64 = 1_704_582_000_000;

pub struct Harness {
    pub controller: Arc<AdmissionController>,
    pub store: Arc<MemoryStore>,
    pub audit: MemoryAuditSink,
    pub clock: ManualClock,
}

pub fn harness(config: TollgateConfig, tenants: Vec<Tenant>) -> Harness {
    build(config, tenants, Some(Arc::new(NoopCircuitBreaker)))
}

/// Harness running the bundled per-endpoint breakers built from `config.breaker`.
pub fn breaker_harness(config: TollgateConfig, tenants: Vec<Tenant>) -> Harness {
    build(config, tenants, None)
}

fn build(
    config: TollgateConfig,
    tenants: Vec<Tenant>,
    breaker: Option<Arc<dyn CircuitBreaker>>,
) -> Harness {
    let clock = ManualClock::new(SATURDAY_NIGHT);
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let audit = MemoryAuditSink::new();
    let mut builder = AdmissionController::builder()
        .config(config)
        .store(store.clone())
        .tenant_directory(Arc::new(InMemoryTenantDirectory::with_tenants(tenants)))
        .audit_sink(Arc::new(audit.clone()))
        .clock(Arc::new(clock.clone()));
    if let Some(breaker) = breaker {
        builder = builder.circuit_breaker(breaker);
    }
    let controller = builder.build().expect("valid controller");
    Harness { controller: Arc::new(controller), store, audit, clock }
}

/// A well-formed browser request that trips no bot or scraping signal on its own.
pub fn browser_request(path: &str, api_key: &str) -> RequestDescriptor {
    let mut req = RequestDescriptor::new("GET", path)
        .with_header("accept", "application/json")
        .with_header("accept-language", "en-US")
        .with_header("accept-encoding", "gzip")
        .with_header("referer", "https://app.example/")
        .with_header("x-client-fingerprint", "fp-1");
    req.api_key = Some(api_key.into());
    req.ip = Some("203.0.113.20".parse().expect("ip"));
    req.user_agent = Some("Mozilla/5.0 (X11; Linux x86_64) Firefox/121.0".into());
    req
}

pub fn tenant_request(path: &str, api_key: &str, tenant: &str) -> RequestDescriptor {
    let mut req = browser_request(path, api_key);
    req.tenant_header = Some(tenant.into());
    req
}

pub fn classified(client: &str, tenant: &Tenant, priority: Priority) -> ClassifiedRequest {
    ClassifiedRequest {
        client: ClientIdentity::from_raw(client),
        tenant: Some(tenant.clone()),
        tier: tenant.tier,
        category: EndpointCategory::Api,
        priority,
        real_time: false,
        batch: false,
    }
}

/// Config where the web category is unweighted and the base rate is `rpm`.
pub fn flat_config(rpm: f64, burst: f64) -> TollgateConfig {
    let mut cfg = TollgateConfig::default();
    cfg.tiers.base_requests_per_minute = rpm;
    cfg.tiers.base_burst_size = burst;
    cfg.endpoints.web = 1.0;
    cfg
}

pub fn starter() -> Tenant {
    Tenant::new("acme", Tier::Starter)
}
