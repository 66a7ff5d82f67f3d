//! Request classification: who is calling, on behalf of which tenant, against what, and how
//! urgently.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::adaptive::DynamicConfig;
use crate::cache::{CacheConfig, ReadThroughCache};
use crate::clock::Clock;
use crate::config::ClassifierConfig;
use crate::error::DirectoryError;

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Default for anonymous and unknown callers.
    #[default]
    Free,
    /// Entry paid tier.
    Starter,
    /// Mid paid tier.
    Professional,
    /// Top tier.
    Enterprise,
}

impl Tier {
    /// Every tier, lowest first.
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Starter, Tier::Professional, Tier::Enterprise];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse endpoint family, chosen by path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointCategory {
    /// `/orchestration`
    Orchestration,
    /// `/agents`
    Agents,
    /// `/security`
    Security,
    /// `/webhooks`
    Webhooks,
    /// `/api`
    Api,
    /// Everything else.
    Web,
}

impl EndpointCategory {
    /// Every category.
    pub const ALL: [EndpointCategory; 6] = [
        EndpointCategory::Orchestration,
        EndpointCategory::Agents,
        EndpointCategory::Security,
        EndpointCategory::Webhooks,
        EndpointCategory::Api,
        EndpointCategory::Web,
    ];

    /// Lowercase name, also used in store keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::Orchestration => "orchestration",
            EndpointCategory::Agents => "agents",
            EndpointCategory::Security => "security",
            EndpointCategory::Webhooks => "webhooks",
            EndpointCategory::Api => "api",
            EndpointCategory::Web => "web",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            EndpointCategory::Orchestration => "/orchestration",
            EndpointCategory::Agents => "/agents",
            EndpointCategory::Security => "/security",
            EndpointCategory::Webhooks => "/webhooks",
            EndpointCategory::Api => "/api",
            EndpointCategory::Web => "/",
        }
    }

    /// Longest matching prefix wins; prefixes match whole path segments only.
    pub fn from_path(path: &str) -> Self {
        Self::ALL
            .into_iter()
            .filter(|c| *c != EndpointCategory::Web && path_has_prefix(path, c.prefix()))
            .max_by_key(|c| c.prefix().len())
            .unwrap_or(EndpointCategory::Web)
    }
}

impl fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

/// Admission priority; lower value is more urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Health checks and security alerting.
    Critical = 1,
    /// Paid high tiers.
    High = 2,
    /// API traffic.
    Medium = 3,
    /// Everything else.
    #[default]
    Low = 4,
}

impl Priority {
    /// Numeric value, 1 (critical) to 4 (low).
    pub fn value(self) -> u32 {
        self as u32
    }

    /// Boost used to discount token-bucket cost.
    pub fn boost(self) -> f64 {
        match self {
            Priority::Critical => 0.9,
            Priority::High => 0.7,
            Priority::Medium => 0.5,
            Priority::Low => 0.0,
        }
    }

    /// Tokens one request of this priority consumes: `max(0.1, 1 - boost * 0.1)`.
    pub fn token_cost(self) -> f64 {
        (1.0 - self.boost() * 0.1).max(0.1)
    }

    /// One level more urgent, saturating at critical.
    pub fn promote(self) -> Self {
        match self {
            Priority::Critical | Priority::High => Priority::Critical,
            Priority::Medium => Priority::High,
            Priority::Low => Priority::Medium,
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Everything the transport knows about an inbound request.
///
/// Header names are stored lowercase; use [`RequestDescriptor::with_header`] and
/// [`RequestDescriptor::header`] rather than touching the map directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Raw API key, if presented.
    pub api_key: Option<String>,
    /// Raw bearer token, if presented.
    pub bearer_token: Option<String>,
    /// Authenticated user id.
    pub user_id: Option<String>,
    /// Peer address.
    pub ip: Option<IpAddr>,
    /// `User-Agent` value.
    pub user_agent: Option<String>,
    /// Explicit tenant id supplied by the transport.
    pub tenant_header: Option<String>,
    /// `Host` value.
    pub host: Option<String>,
    /// Tenant of the authenticated user.
    pub authenticated_tenant: Option<String>,
    /// Request path, including any query string.
    pub path: String,
    /// HTTP method.
    pub method: String,
    /// Request headers, lowercase names.
    pub headers: HashMap<String, String>,
    /// Body size in bytes.
    pub payload_size: u64,
    /// Body, when the transport kept it for replay.
    pub body: Option<Vec<u8>>,
    /// Caller asked for low-latency handling.
    pub real_time: bool,
    /// Caller marked the request as bulk work.
    pub batch: bool,
    /// Tier hint for callers without a tenant.
    pub user_tier: Option<Tier>,
}

impl RequestDescriptor {
    /// Minimal descriptor for `method path`.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self { method: method.into(), path: path.into(), ..Self::default() }
    }

    /// Add a header (name lowercased).
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Path without the query string.
    pub fn path_only(&self) -> &str {
        self.path.split_once('?').map_or(self.path.as_str(), |(p, _)| p)
    }

    /// Number of `&`-separated query parameters.
    pub fn query_param_count(&self) -> usize {
        match self.path.split_once('?') {
            Some((_, q)) => q.split('&').filter(|p| !p.is_empty()).count(),
            None => 0,
        }
    }
}

/// Stable per-request caller identity. Never persisted beyond store keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Derive an identity: API key hash, bearer token hash, user id, then hash of (IP, UA).
    pub fn derive(req: &RequestDescriptor) -> Self {
        if let Some(key) = non_empty(&req.api_key) {
            return Self(format!("key:{}", digest(&[key])));
        }
        if let Some(token) = non_empty(&req.bearer_token) {
            return Self(format!("bearer:{}", digest(&[token])));
        }
        if let Some(user) = non_empty(&req.user_id) {
            return Self(format!("user:{user}"));
        }
        let ip = req.ip.map(|ip| ip.to_string()).unwrap_or_default();
        let ua = req.user_agent.as_deref().unwrap_or_default();
        Self(format!("fp:{}", digest(&[ip.as_str(), ua])))
    }

    /// Wrap an already-derived identity.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Identity as a key fragment.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Tenant metadata owned by an external directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant id.
    pub id: String,
    /// Subscription tier.
    pub tier: Tier,
    /// Hard cap on requests per minute.
    #[serde(default)]
    pub max_requests_per_minute: Option<f64>,
    /// Inactive tenants are treated as unknown.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Hosts served for this tenant.
    #[serde(default)]
    pub domains: Vec<String>,
}

fn default_active() -> bool {
    true
}

impl Tenant {
    /// Active tenant with no cap and no domains.
    pub fn new(id: impl Into<String>, tier: Tier) -> Self {
        Self { id: id.into(), tier, max_requests_per_minute: None, active: true, domains: Vec::new() }
    }

    /// Set the hard cap.
    pub fn with_cap(mut self, rpm: f64) -> Self {
        self.max_requests_per_minute = Some(rpm);
        self
    }

    /// Add a served domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into().to_ascii_lowercase());
        self
    }

    /// Mark inactive.
    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Read-only tenant lookups.
#[async_trait]
pub trait TenantDirectory: Send + Sync + fmt::Debug {
    /// Tenant by id.
    async fn tenant(&self, id: &str) -> Result<Option<Tenant>, DirectoryError>;
    /// Tenant serving `domain` (lowercase, no port).
    async fn tenant_for_domain(&self, domain: &str) -> Result<Option<Tenant>, DirectoryError>;
}

/// Directory held in memory; suitable for tests and static deployments.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTenantDirectory {
    tenants: Arc<RwLock<HashMap<String, Tenant>>>,
}

impl InMemoryTenantDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory pre-populated with `tenants`.
    pub fn with_tenants(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        let dir = Self::new();
        for t in tenants {
            dir.upsert(t);
        }
        dir
    }

    /// Insert or replace a tenant.
    pub fn upsert(&self, tenant: Tenant) {
        self.tenants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tenant.id.clone(), tenant);
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn tenant(&self, id: &str) -> Result<Option<Tenant>, DirectoryError> {
        Ok(self.tenants.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned())
    }

    async fn tenant_for_domain(&self, domain: &str) -> Result<Option<Tenant>, DirectoryError> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        Ok(tenants.values().find(|t| t.domains.iter().any(|d| d == domain)).cloned())
    }
}

/// Output of [`RequestClassifier::classify`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRequest {
    /// Caller identity.
    pub client: ClientIdentity,
    /// Resolved active tenant.
    pub tenant: Option<Tenant>,
    /// Effective tier.
    pub tier: Tier,
    /// Endpoint family.
    pub category: EndpointCategory,
    /// Admission priority.
    pub priority: Priority,
    /// Low-latency hint.
    pub real_time: bool,
    /// Bulk hint.
    pub batch: bool,
}

impl ClassifiedRequest {
    /// Tenant id, if any.
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant.as_ref().map(|t| t.id.as_str())
    }

    /// Priority used when deferring: real-time requests move up one level, batch drops to low.
    pub fn queue_priority(&self) -> Priority {
        if self.batch {
            Priority::Low
        } else if self.real_time {
            self.priority.promote()
        } else {
            self.priority
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TenantKey {
    Id(String),
    Domain(String),
}

/// Derives identity, tenant, tier, category and priority for each request.
#[derive(Debug)]
pub struct RequestClassifier {
    directory: Arc<dyn TenantDirectory>,
    cache: ReadThroughCache<TenantKey, Option<Tenant>>,
    config: DynamicConfig<ClassifierConfig>,
}

impl RequestClassifier {
    /// Classifier backed by `directory`, caching lookups for `config.tenant_cache_ttl_secs`.
    pub fn new(
        config: ClassifierConfig,
        directory: Arc<dyn TenantDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ttl = Duration::from_secs(config.tenant_cache_ttl_secs);
        Self {
            directory,
            cache: ReadThroughCache::new(CacheConfig::with_ttl(ttl), clock),
            config: DynamicConfig::new(config),
        }
    }

    /// Swap the classification settings.
    pub fn set_config(&self, config: ClassifierConfig) {
        self.config.set(config);
    }

    /// Classify one request.
    pub async fn classify(
        &self,
        req: &RequestDescriptor,
    ) -> Result<ClassifiedRequest, DirectoryError> {
        let config = self.config.get();
        let client = ClientIdentity::derive(req);
        let tenant = self.resolve_tenant(req, &config).await?;
        let tier = tenant.as_ref().map(|t| t.tier).or(req.user_tier).unwrap_or_default();
        let path = req.path_only();
        let category = EndpointCategory::from_path(path);
        let priority = if config.critical_paths.iter().any(|p| path_has_prefix(path, p)) {
            Priority::Critical
        } else if matches!(tier, Tier::Professional | Tier::Enterprise) {
            Priority::High
        } else if category == EndpointCategory::Api {
            Priority::Medium
        } else {
            Priority::Low
        };
        debug!(
            target: "tollgate::classifier",
            client = %client,
            tenant = tenant.as_ref().map(|t| t.id.as_str()).unwrap_or("-"),
            tier = tier.as_str(),
            category = category.as_str(),
            priority = priority.as_str(),
            "classified request"
        );
        Ok(ClassifiedRequest {
            client,
            tenant,
            tier,
            category,
            priority,
            real_time: req.real_time,
            batch: req.batch,
        })
    }

    async fn resolve_tenant(
        &self,
        req: &RequestDescriptor,
        config: &ClassifierConfig,
    ) -> Result<Option<Tenant>, DirectoryError> {
        let explicit = non_empty(&req.tenant_header)
            .or_else(|| req.header(&config.tenant_header).map(str::trim).filter(|s| !s.is_empty()));
        if let Some(id) = explicit {
            let found = self.lookup(TenantKey::Id(id.to_string())).await?;
            return Ok(usable(found, id, "header"));
        }

        if let Some(host) = non_empty(&req.host) {
            let domain = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
            if let Some(found) = self.lookup(TenantKey::Domain(domain.clone())).await? {
                return Ok(usable(Some(found), &domain, "domain"));
            }
        }

        if let Some(id) = non_empty(&req.authenticated_tenant) {
            let found = self.lookup(TenantKey::Id(id.to_string())).await?;
            return Ok(usable(found, id, "user"));
        }
        Ok(None)
    }

    /// Tenant metadata by id, through the lookup cache.
    pub async fn tenant(&self, id: &str) -> Result<Option<Tenant>, DirectoryError> {
        self.lookup(TenantKey::Id(id.to_string())).await
    }

    async fn lookup(&self, key: TenantKey) -> Result<Option<Tenant>, DirectoryError> {
        let directory = &self.directory;
        self.cache
            .get_or_load(&key, || async {
                match &key {
                    TenantKey::Id(id) => directory.tenant(id).await,
                    TenantKey::Domain(domain) => directory.tenant_for_domain(domain).await,
                }
            })
            .await
    }
}

fn usable(found: Option<Tenant>, reference: &str, source: &'static str) -> Option<Tenant> {
    match found {
        Some(t) if t.active => Some(t),
        Some(t) => {
            warn!(target: "tollgate::classifier", tenant = %t.id, source, "tenant inactive; treating request as tenantless");
            None
        }
        None => {
            warn!(target: "tollgate::classifier", reference, source, "unknown tenant; treating request as tenantless");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn classifier(tenants: Vec<Tenant>) -> RequestClassifier {
        RequestClassifier::new(
            ClassifierConfig::default(),
            Arc::new(InMemoryTenantDirectory::with_tenants(tenants)),
            Arc::new(ManualClock::new(0)),
        )
    }

    #[test]
    fn category_uses_segment_prefixes() {
        assert_eq!(EndpointCategory::from_path("/api/v1/users"), EndpointCategory::Api);
        assert_eq!(EndpointCategory::from_path("/api"), EndpointCategory::Api);
        assert_eq!(EndpointCategory::from_path("/apiary"), EndpointCategory::Web);
        assert_eq!(EndpointCategory::from_path("/security/alerts"), EndpointCategory::Security);
        assert_eq!(EndpointCategory::from_path("/"), EndpointCategory::Web);
    }

    #[test]
    fn token_cost_follows_boost() {
        assert!((Priority::Critical.token_cost() - 0.91).abs() < 1e-9);
        assert!((Priority::High.token_cost() - 0.93).abs() < 1e-9);
        assert!((Priority::Medium.token_cost() - 0.95).abs() < 1e-9);
        assert_eq!(Priority::Low.token_cost(), 1.0);
    }

    #[test]
    fn identity_prefers_api_key_then_bearer_then_user() {
        let mut req = RequestDescriptor::new("GET", "/");
        req.ip = Some("203.0.113.9".parse().unwrap());
        req.user_agent = Some("curl/8".into());
        assert!(ClientIdentity::derive(&req).as_str().starts_with("fp:"));

        req.user_id = Some("u-1".into());
        assert_eq!(ClientIdentity::derive(&req).as_str(), "user:u-1");

        req.bearer_token = Some("tok".into());
        assert!(ClientIdentity::derive(&req).as_str().starts_with("bearer:"));

        req.api_key = Some("sk-123".into());
        let id = ClientIdentity::derive(&req);
        assert!(id.as_str().starts_with("key:"));
        assert!(!id.as_str().contains("sk-123"));
        assert_eq!(id, ClientIdentity::derive(&req));
    }

    #[test]
    fn queue_priority_respects_hints() {
        let base = ClassifiedRequest {
            client: ClientIdentity::from_raw("c"),
            tenant: None,
            tier: Tier::Free,
            category: EndpointCategory::Api,
            priority: Priority::Medium,
            real_time: true,
            batch: false,
        };
        assert_eq!(base.queue_priority(), Priority::High);
        let batch = ClassifiedRequest { batch: true, ..base };
        assert_eq!(batch.queue_priority(), Priority::Low);
    }

    #[tokio::test]
    async fn header_tenant_sets_tier_and_priority() {
        let c = classifier(vec![Tenant::new("acme", Tier::Enterprise)]);
        let req = RequestDescriptor::new("GET", "/api/things").with_header("X-Tenant-Id", "acme");
        let out = c.classify(&req).await.unwrap();
        assert_eq!(out.tenant_id(), Some("acme"));
        assert_eq!(out.tier, Tier::Enterprise);
        assert_eq!(out.priority, Priority::High);
        assert_eq!(out.category, EndpointCategory::Api);
    }

    #[tokio::test]
    async fn domain_lookup_strips_port() {
        let c = classifier(vec![Tenant::new("globex", Tier::Starter).with_domain("globex.example")]);
        let mut req = RequestDescriptor::new("GET", "/dashboard");
        req.host = Some("Globex.Example:8443".into());
        let out = c.classify(&req).await.unwrap();
        assert_eq!(out.tenant_id(), Some("globex"));
        assert_eq!(out.priority, Priority::Low);
    }

    #[tokio::test]
    async fn unknown_and_inactive_tenants_are_dropped() {
        let c = classifier(vec![Tenant::new("gone", Tier::Professional).deactivated()]);
        let mut req = RequestDescriptor::new("GET", "/api/x");
        req.tenant_header = Some("gone".into());
        req.user_tier = Some(Tier::Starter);
        let out = c.classify(&req).await.unwrap();
        assert!(out.tenant.is_none());
        assert_eq!(out.tier, Tier::Starter);

        req.tenant_header = Some("nobody".into());
        req.user_tier = None;
        let out = c.classify(&req).await.unwrap();
        assert!(out.tenant.is_none());
        assert_eq!(out.tier, Tier::Free);
    }

    #[tokio::test]
    async fn health_paths_are_critical() {
        let c = classifier(vec![]);
        let out = c.classify(&RequestDescriptor::new("GET", "/healthz")).await.unwrap();
        assert_eq!(out.priority, Priority::Critical);
        let out = c.classify(&RequestDescriptor::new("POST", "/security/alerts/7")).await.unwrap();
        assert_eq!(out.priority, Priority::Critical);
    }
}
