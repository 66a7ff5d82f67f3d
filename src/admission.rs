//! Admission controller: the per-request decision pipeline.
//!
//! ```text
//! classify -> cooldown -> threat (>= high rejects) -> circuit breaker -> tier policy
//!          -> user / organization / endpoint / global scopes -> admit | defer | reject
//! ```
//!
//! All four scopes are evaluated on every request that reaches them, so a denial in one scope
//! still consumes from the others. Store outages fail open and are flagged on the decision.
//! Admissions and global-scope denials feed the endpoint's circuit breaker.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::adaptive::DynamicConfig;
use crate::audit::{self, AuditEvent, AuditSink, TracingAuditSink};
use crate::circuit_breaker::{CircuitBreaker, EndpointCircuitBreakers};
use crate::classifier::{
    ClassifiedRequest, ClientIdentity, RequestClassifier, RequestDescriptor, TenantDirectory,
};
use crate::clock::{Clock, SystemClock};
use crate::config::TollgateConfig;
use crate::error::{AdmissionError, ConfigError, StoreError};
use crate::policy::{FixedLoad, LoadProbe, TierPolicy};
use crate::queue::{estimate_wait_seconds, DeferredQueue, EnqueueOutcome, Executor, QueueProcessor};
use crate::rate_limit::{
    Algorithm, AlgorithmBank, FixedWindow, Scope, ScopeResult, SlidingWindow, TokenBucket,
};
use crate::store::AtomicStore;
use crate::threat::{ReputationSource, ThreatAssessment, ThreatLevel, ThreatScorer};

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// The client is serving a cooldown from an earlier threat verdict.
    ClientBlocked,
    /// This request scored high or critical.
    ThreatDetected,
    /// The endpoint's breaker is open.
    CircuitBreakerOpen,
    /// Rate limited and the tenant queue is too full to defer.
    QueueFull,
    /// Rate limited (possibly deferred).
    RateLimitExceeded,
}

impl BlockReason {
    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::ClientBlocked => "client_blocked",
            BlockReason::ThreatDetected => "threat_detected",
            BlockReason::CircuitBreakerOpen => "circuit_breaker_open",
            BlockReason::QueueFull => "queue_full",
            BlockReason::RateLimitExceeded => "rate_limit_exceeded",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`AdmissionController::admit`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionDecision {
    /// Forward the request now.
    pub allowed: bool,
    /// Per-scope results; empty when the request was rejected before scopes ran.
    pub scopes: Vec<ScopeResult>,
    /// Limit of the binding scope.
    pub limit: u64,
    /// Remaining allowance of the binding scope.
    pub remaining: u64,
    /// Epoch seconds at which the binding scope resets.
    pub reset_time: u64,
    /// Seconds the caller should wait; zero when admitted.
    pub retry_after: u64,
    /// Parked in the deferred queue.
    pub queued: bool,
    /// 1-based position when queued.
    pub queue_position: Option<usize>,
    /// Rough seconds until replay when queued.
    pub estimated_wait_seconds: Option<u64>,
    /// Threat verdict, `None` when scoring did not run.
    pub threat_level: ThreatLevel,
    /// Why the request was not admitted.
    pub blocked_reason: Option<BlockReason>,
    /// Some state could not be read and was treated as permissive.
    pub fail_open: bool,
    /// Caller identity.
    pub client: ClientIdentity,
    /// Resolved tenant.
    pub tenant_id: Option<String>,
}

impl AdmissionDecision {
    fn rejected(
        classified: &ClassifiedRequest,
        reason: BlockReason,
        retry_after: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            allowed: false,
            scopes: Vec::new(),
            limit: 0,
            remaining: 0,
            reset_time: now_ms / 1000 + retry_after,
            retry_after,
            queued: false,
            queue_position: None,
            estimated_wait_seconds: None,
            threat_level: ThreatLevel::None,
            blocked_reason: Some(reason),
            fail_open: false,
            client: classified.client.clone(),
            tenant_id: classified.tenant_id().map(str::to_string),
        }
    }

    /// `X-RateLimit-*` and `Retry-After` response headers.
    pub fn rate_limit_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(4);
        if !self.scopes.is_empty() {
            headers.push(("X-RateLimit-Limit", self.limit.to_string()));
            headers.push(("X-RateLimit-Remaining", self.remaining.to_string()));
            headers.push(("X-RateLimit-Reset", self.reset_time.to_string()));
        }
        if !self.allowed && self.retry_after > 0 {
            headers.push(("Retry-After", self.retry_after.to_string()));
        }
        headers
    }
}

/// Store key of a client's cooldown flag.
pub fn block_key(client: &ClientIdentity) -> String {
    format!("block:{client}")
}

/// Store key of a tenant's organization bucket.
pub fn organization_key(tenant: &str) -> String {
    format!("organization:{tenant}")
}

/// Builder for [`AdmissionController`].
#[derive(Debug, Default)]
pub struct AdmissionControllerBuilder {
    config: TollgateConfig,
    store: Option<Arc<dyn AtomicStore>>,
    directory: Option<Arc<dyn TenantDirectory>>,
    breaker: Option<Arc<dyn CircuitBreaker>>,
    audit: Option<Arc<dyn AuditSink>>,
    load: Option<Arc<dyn LoadProbe>>,
    reputation: Option<Arc<dyn ReputationSource>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AdmissionControllerBuilder {
    /// Initial configuration (default otherwise).
    pub fn config(mut self, config: TollgateConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared state backend. Required.
    pub fn store(mut self, store: Arc<dyn AtomicStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Tenant metadata source. Required.
    pub fn tenant_directory(mut self, directory: Arc<dyn TenantDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Breaker implementation; defaults to [`EndpointCircuitBreakers`] from `config.breaker`.
    pub fn circuit_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Audit destination; defaults to [`TracingAuditSink`].
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// System load source; defaults to a constant zero.
    pub fn load_probe(mut self, load: Arc<dyn LoadProbe>) -> Self {
        self.load = Some(load);
        self
    }

    /// IP reputation feed; the signal is disabled without one.
    pub fn reputation_source(mut self, source: Arc<dyn ReputationSource>) -> Self {
        self.reputation = Some(source);
        self
    }

    /// Time source; defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate configuration and assemble the controller.
    pub fn build(self) -> Result<AdmissionController, ConfigError> {
        self.config.validate()?;
        let store = self.store.ok_or(ConfigError::Missing("store"))?;
        let directory = self.directory.ok_or(ConfigError::Missing("tenant directory"))?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let breaker: Arc<dyn CircuitBreaker> = match self.breaker {
            Some(breaker) => breaker,
            None => Arc::new(EndpointCircuitBreakers::new(self.config.breaker.clone(), clock.clone())?),
        };
        let audit: Arc<dyn AuditSink> = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let load: Arc<dyn LoadProbe> = self.load.unwrap_or_else(|| Arc::new(FixedLoad::new(0.0)));

        let classifier = Arc::new(RequestClassifier::new(
            self.config.classifier.clone(),
            directory,
            clock.clone(),
        ));
        let mut threat = ThreatScorer::new(store.clone(), self.config.threat.clone(), clock.clone());
        if let Some(source) = self.reputation {
            threat = threat.with_reputation(source);
        }
        let config = DynamicConfig::new(self.config);
        Ok(AdmissionController {
            policy: TierPolicy::new(config.clone(), load, clock.clone()),
            bank: AlgorithmBank::new(store.clone()),
            queue: DeferredQueue::new(store.clone(), config.clone(), clock.clone()),
            threat: Arc::new(threat),
            config,
            store,
            classifier,
            breaker,
            audit,
            clock,
        })
    }
}

/// Decides, per request, whether to admit, defer or reject.
#[derive(Debug)]
pub struct AdmissionController {
    config: DynamicConfig<TollgateConfig>,
    store: Arc<dyn AtomicStore>,
    classifier: Arc<RequestClassifier>,
    policy: TierPolicy,
    bank: AlgorithmBank,
    threat: Arc<ThreatScorer>,
    breaker: Arc<dyn CircuitBreaker>,
    queue: DeferredQueue,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    /// Start building a controller.
    pub fn builder() -> AdmissionControllerBuilder {
        AdmissionControllerBuilder::default()
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<TollgateConfig> {
        self.config.get()
    }

    /// Validate and atomically swap the live configuration.
    ///
    /// Breaker thresholds are fixed at build time.
    pub fn update_config(&self, config: TollgateConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.classifier.set_config(config.classifier.clone());
        self.threat.set_config(config.threat.clone());
        self.config.set(config);
        debug!(target: "tollgate::admission", "configuration updated");
        Ok(())
    }

    /// Deferred queue shared with the processor.
    pub fn queue(&self) -> &DeferredQueue {
        &self.queue
    }

    /// Request classifier.
    pub fn classifier(&self) -> &Arc<RequestClassifier> {
        &self.classifier
    }

    /// Threat scorer.
    pub fn threat(&self) -> &Arc<ThreatScorer> {
        &self.threat
    }

    /// Shared store.
    pub fn store(&self) -> &Arc<dyn AtomicStore> {
        &self.store
    }

    /// Queue processor replaying deferred requests through `executor`.
    pub fn processor(&self, executor: Arc<dyn Executor>) -> QueueProcessor {
        QueueProcessor::new(
            self.queue.clone(),
            self.classifier.clone(),
            self.policy.clone(),
            self.bank.clone(),
            executor,
            self.audit.clone(),
            self.clock.clone(),
        )
    }

    /// Report a failed authentication so brute-force scoring can see it.
    pub async fn record_auth_failure(&self, ip: std::net::IpAddr) -> Result<u64, StoreError> {
        self.threat.record_auth_failure(ip).await
    }

    /// Decide on one request.
    pub async fn admit(&self, req: &RequestDescriptor) -> Result<AdmissionDecision, AdmissionError> {
        let cfg = self.config.get();
        let classified = self.classifier.classify(req).await?;
        let now = self.clock.now_millis();
        let mut fail_open = false;

        match self.store.flag_ttl(&block_key(&classified.client)).await {
            Ok(Some(remaining)) => {
                let decision = AdmissionDecision::rejected(
                    &classified,
                    BlockReason::ClientBlocked,
                    ceil_secs(remaining),
                    now,
                );
                return Ok(self.reject(req, decision).await);
            }
            Ok(None) => {}
            Err(err) => {
                error!(target: "tollgate::store", client = %classified.client, error = %err, "cooldown lookup failed; failing open");
                fail_open = true;
            }
        }

        let assessment = self.threat.assess(req, &classified).await;
        fail_open |= assessment.fail_open;
        if assessment.level.is_blocking() {
            return Ok(self.block_threat(req, &classified, &assessment, &cfg, now, fail_open).await);
        }

        let endpoint = classified.category.as_str();
        if self.breaker.is_open(endpoint) {
            let retry_after = ceil_secs(self.breaker.recovery_time(endpoint)).max(1);
            let mut decision = AdmissionDecision::rejected(
                &classified,
                BlockReason::CircuitBreakerOpen,
                retry_after,
                now,
            );
            decision.threat_level = assessment.level;
            decision.fail_open = fail_open;
            return Ok(self.reject(req, decision).await);
        }

        let limits = self.policy.resolve_with(&cfg, &classified, classified.tenant.as_ref());
        let cost = classified.priority.token_cost();
        let user_key = format!("user:{}", classified.client);
        let endpoint_key = format!("endpoint:{endpoint}:{}", classified.client);
        let user_bucket = TokenBucket { capacity: limits.user.capacity, cost };
        let endpoint_window = SlidingWindow(limits.endpoint);
        let global_window = FixedWindow(limits.global);

        let organization = async {
            match (classified.tenant_id(), limits.organization) {
                (Some(tenant), Some(limit)) => {
                    let bucket = TokenBucket { capacity: limit.capacity, cost };
                    self.bank
                        .evaluate(Scope::Organization, &organization_key(tenant), &bucket, now)
                        .await
                }
                _ => ScopeResult::skipped(Scope::Organization, "no tenant", now),
            }
        };
        let (user, organization, endpoint_result, global) = futures::join!(
            self.bank.evaluate(Scope::User, &user_key, &user_bucket, now),
            organization,
            self.bank.evaluate(Scope::Endpoint, &endpoint_key, &endpoint_window, now),
            self.bank.evaluate(Scope::Global, "global:all", &global_window, now),
        );
        let scopes = vec![user, organization, endpoint_result, global];
        fail_open |= scopes.iter().any(|s| s.fail_open);

        let allowed = scopes.iter().all(|s| s.allowed);
        let binding = binding_scope(&scopes);
        let mut decision = AdmissionDecision {
            allowed,
            limit: binding.map_or(0, |s| s.limit),
            remaining: binding.map_or(0, |s| s.remaining),
            reset_time: binding.map_or(now / 1000, |s| s.reset_time),
            retry_after: scopes.iter().filter(|s| !s.allowed).map(|s| s.retry_after).max().unwrap_or(0),
            scopes,
            queued: false,
            queue_position: None,
            estimated_wait_seconds: None,
            threat_level: assessment.level,
            blocked_reason: None,
            fail_open,
            client: classified.client.clone(),
            tenant_id: classified.tenant_id().map(str::to_string),
        };

        if allowed {
            self.breaker.record_success(endpoint);
            debug!(
                target: "tollgate::admission",
                client = %classified.client,
                endpoint,
                remaining = decision.remaining,
                "request admitted"
            );
            return Ok(decision);
        }

        // Per-caller quotas never count against the endpoint; only global saturation does.
        if decision.scopes.iter().any(|s| s.scope == Scope::Global && !s.allowed) {
            self.breaker.record_failure(endpoint);
        }
        decision.blocked_reason = Some(BlockReason::RateLimitExceeded);
        let Some(tenant) = classified.tenant_id() else {
            return Ok(self.reject(req, decision).await);
        };

        match self.queue.enqueue(&classified, tenant, req, limits.queue_capacity).await {
            Ok(EnqueueOutcome::Queued { id, position }) => {
                decision.queued = true;
                decision.queue_position = Some(position);
                decision.estimated_wait_seconds =
                    Some(estimate_wait_seconds(position, &cfg.processor));
                warn!(
                    target: "tollgate::admission",
                    client = %classified.client,
                    tenant,
                    entry = %id,
                    position,
                    "rate limited; request deferred"
                );
                Ok(decision)
            }
            Ok(EnqueueOutcome::Full { .. }) => {
                decision.blocked_reason = Some(BlockReason::QueueFull);
                Ok(self.reject(req, decision).await)
            }
            Ok(EnqueueOutcome::Disabled) => Ok(self.reject(req, decision).await),
            Err(err) => {
                error!(target: "tollgate::queue", tenant, error = %err, "enqueue failed");
                Ok(self.reject(req, decision).await)
            }
        }
    }

    async fn block_threat(
        &self,
        req: &RequestDescriptor,
        classified: &ClassifiedRequest,
        assessment: &ThreatAssessment,
        cfg: &TollgateConfig,
        now: u64,
        fail_open: bool,
    ) -> AdmissionDecision {
        let cooldown = cfg.threat.cooldown_for(assessment.level);
        if let Err(err) = self.store.set_flag(&block_key(&classified.client), cooldown).await {
            error!(target: "tollgate::store", client = %classified.client, error = %err, "could not set cooldown");
        }
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::ThreatDetected {
                at_ms: now,
                client: classified.client.to_string(),
                tenant: classified.tenant_id().map(str::to_string),
                ip: req.ip,
                path: req.path.clone(),
                level: assessment.level,
                primary: assessment.primary.to_string(),
                signals: assessment.signals,
            },
        )
        .await;
        let mut decision = AdmissionDecision::rejected(
            classified,
            BlockReason::ThreatDetected,
            cooldown.as_secs(),
            now,
        );
        decision.threat_level = assessment.level;
        decision.fail_open = fail_open;
        self.reject(req, decision).await
    }

    async fn reject(&self, req: &RequestDescriptor, decision: AdmissionDecision) -> AdmissionDecision {
        let reason = decision.blocked_reason.unwrap_or(BlockReason::RateLimitExceeded);
        warn!(
            target: "tollgate::admission",
            client = %decision.client,
            tenant = decision.tenant_id.as_deref().unwrap_or("-"),
            path = %req.path,
            reason = reason.as_str(),
            retry_after = decision.retry_after,
            "request rejected"
        );
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::AdmissionRejected {
                at_ms: self.clock.now_millis(),
                client: decision.client.to_string(),
                tenant: decision.tenant_id.clone(),
                path: req.path.clone(),
                reason,
                retry_after: decision.retry_after,
            },
        )
        .await;
        decision
    }
}

/// Scope that explains the decision: the denied scope with the longest wait, otherwise the
/// evaluated scope with the least headroom.
fn binding_scope(scopes: &[ScopeResult]) -> Option<&ScopeResult> {
    let evaluated = || scopes.iter().filter(|s| s.algorithm != Algorithm::Skipped);
    evaluated()
        .filter(|s| !s.allowed)
        .max_by_key(|s| s.retry_after)
        .or_else(|| evaluated().min_by_key(|s| s.remaining.saturating_mul(1_000) / s.limit.max(1)))
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1000).try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::circuit_breaker::NoopCircuitBreaker;
    use crate::classifier::{InMemoryTenantDirectory, Tenant, Tier};
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::testing::FailingStore;

    const SATURDAY_NIGHT: u64 = 1_704_582_000_000;

    struct Fixture {
        controller: AdmissionController,
        audit: MemoryAuditSink,
        store: Arc<MemoryStore>,
        clock: ManualClock,
    }

    fn fixture(config: TollgateConfig) -> Fixture {
        let clock = ManualClock::new(SATURDAY_NIGHT);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let audit = MemoryAuditSink::new();
        let directory = InMemoryTenantDirectory::with_tenants([Tenant::new("acme", Tier::Starter)]);
        let controller = AdmissionController::builder()
            .config(config)
            .store(store.clone())
            .tenant_directory(Arc::new(directory))
            .circuit_breaker(Arc::new(NoopCircuitBreaker))
            .audit_sink(Arc::new(audit.clone()))
            .clock(Arc::new(clock.clone()))
            .build()
            .expect("valid controller");
        Fixture { controller, audit, store, clock }
    }

    fn api_request(key: &str) -> RequestDescriptor {
        let mut req = RequestDescriptor::new("GET", "/api/items")
            .with_header("accept", "application/json")
            .with_header("accept-language", "en")
            .with_header("accept-encoding", "gzip")
            .with_header("x-client-fingerprint", "fp");
        req.api_key = Some(key.into());
        req.ip = Some("203.0.113.9".parse().unwrap());
        req.user_agent = Some("Mozilla/5.0 (X11; Linux x86_64) Firefox/121.0".into());
        req
    }

    #[test]
    fn builder_requires_store_and_directory() {
        let err = AdmissionController::builder().build().unwrap_err();
        assert_eq!(err, ConfigError::Missing("store"));
        let err = AdmissionController::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("tenant directory"));
    }

    #[tokio::test]
    async fn admits_and_reports_headers() {
        let f = fixture(TollgateConfig::default());
        let decision = f.controller.admit(&api_request("k1")).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.scopes.len(), 4);
        assert_eq!(decision.scopes[1].algorithm, Algorithm::Skipped);
        let headers = decision.rate_limit_headers();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].0, "X-RateLimit-Limit");
        assert!(!decision.fail_open);
    }

    #[tokio::test]
    async fn rejects_without_tenant_once_bucket_is_empty() {
        let mut cfg = TollgateConfig::default();
        cfg.tiers.base_requests_per_minute = 2.0;
        cfg.tiers.base_burst_size = 50.0;
        let f = fixture(cfg);
        let req = api_request("k1");
        // Free tier, api category, medium priority: capacity 2, cost 0.95.
        assert!(f.controller.admit(&req).await.unwrap().allowed);
        assert!(f.controller.admit(&req).await.unwrap().allowed);
        let denied = f.controller.admit(&req).await.unwrap();
        assert!(!denied.allowed);
        assert!(!denied.queued);
        assert_eq!(denied.blocked_reason, Some(BlockReason::RateLimitExceeded));
        assert!(denied.retry_after >= 1);
        assert!(denied.rate_limit_headers().iter().any(|(h, _)| *h == "Retry-After"));
        assert_eq!(f.audit.events_of("admission_rejected").await.len(), 1);
    }

    #[tokio::test]
    async fn tenant_requests_are_deferred_when_limited() {
        let mut cfg = TollgateConfig::default();
        cfg.tiers.base_requests_per_minute = 0.2;
        let f = fixture(cfg);
        let mut req = api_request("k1");
        req.tenant_header = Some("acme".into());
        // Starter: 0.2 * 5 = 1 request per minute.
        assert!(f.controller.admit(&req).await.unwrap().allowed);
        let deferred = f.controller.admit(&req).await.unwrap();
        assert!(!deferred.allowed);
        assert!(deferred.queued);
        assert_eq!(deferred.queue_position, Some(1));
        assert_eq!(deferred.estimated_wait_seconds, Some(1));
        assert_eq!(deferred.tenant_id.as_deref(), Some("acme"));
        assert_eq!(f.controller.queue().len("acme").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn threat_verdict_sets_cooldown() {
        let mut cfg = TollgateConfig::default();
        cfg.threat.ddos_threshold = 3;
        let f = fixture(cfg);
        let req = api_request("k1");
        for _ in 0..2 {
            assert!(f.controller.admit(&req).await.unwrap().allowed);
        }
        let blocked = f.controller.admit(&req).await.unwrap();
        assert_eq!(blocked.blocked_reason, Some(BlockReason::ThreatDetected));
        assert_eq!(blocked.threat_level, ThreatLevel::Critical);
        assert_eq!(blocked.retry_after, 3_600);
        assert_eq!(f.audit.events_of("threat_detected").await.len(), 1);

        f.clock.advance(60_000);
        let again = f.controller.admit(&req).await.unwrap();
        assert_eq!(again.blocked_reason, Some(BlockReason::ClientBlocked));
        assert_eq!(again.retry_after, 3_540);
        assert!(f.store.flag_ttl(&block_key(&blocked.client)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn open_breaker_short_circuits() {
        let clock = ManualClock::new(SATURDAY_NIGHT);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let config = TollgateConfig::default();
        let breaker = Arc::new(
            EndpointCircuitBreakers::new(config.breaker.clone(), Arc::new(clock.clone())).unwrap(),
        );
        for _ in 0..config.breaker.minimum_requests {
            breaker.record_failure("api");
        }
        let controller = AdmissionController::builder()
            .config(config)
            .store(store)
            .tenant_directory(Arc::new(InMemoryTenantDirectory::new()))
            .circuit_breaker(breaker)
            .audit_sink(Arc::new(MemoryAuditSink::new()))
            .clock(Arc::new(clock))
            .build()
            .unwrap();
        let decision = controller.admit(&api_request("k1")).await.unwrap();
        assert_eq!(decision.blocked_reason, Some(BlockReason::CircuitBreakerOpen));
        assert_eq!(decision.retry_after, 30);
        assert!(decision.scopes.is_empty());
    }

    #[tokio::test]
    async fn store_outage_admits_with_fail_open() {
        let controller = AdmissionController::builder()
            .store(Arc::new(FailingStore))
            .tenant_directory(Arc::new(InMemoryTenantDirectory::new()))
            .circuit_breaker(Arc::new(NoopCircuitBreaker))
            .audit_sink(Arc::new(MemoryAuditSink::new()))
            .clock(Arc::new(ManualClock::new(SATURDAY_NIGHT)))
            .build()
            .unwrap();
        let decision = controller.admit(&api_request("k1")).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.fail_open);
    }

    #[tokio::test]
    async fn update_config_validates_before_swapping() {
        let f = fixture(TollgateConfig::default());
        let mut bad = TollgateConfig::default();
        bad.tiers.base_requests_per_minute = 0.0;
        assert!(f.controller.update_config(bad).is_err());
        assert_eq!(f.controller.config().tiers.base_requests_per_minute, 100.0);

        let mut good = TollgateConfig::default();
        good.tiers.base_requests_per_minute = 42.0;
        f.controller.update_config(good).unwrap();
        assert_eq!(f.controller.config().tiers.base_requests_per_minute, 42.0);
    }

    #[test]
    fn block_reasons_serialize_snake_case() {
        assert_eq!(serde_json::to_string(&BlockReason::CircuitBreakerOpen).unwrap(), "\"circuit_breaker_open\"");
        assert_eq!(BlockReason::QueueFull.to_string(), "queue_full");
    }
}
