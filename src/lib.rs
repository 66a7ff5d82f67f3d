#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Admission control for multi-tenant APIs. Every inbound request is admitted, deferred or
//! rejected based on:
//!
//! - **Tiered rate limits** over four scopes (user, organization, endpoint, global) using a
//!   priority-weighted token bucket, a sliding window with a burst sub-window, and a fixed
//!   window
//! - **Threat scoring** from seven signals (single-IP and distributed floods, bots, scraping,
//!   brute force, statistical anomalies, IP reputation) with client cooldowns
//! - **Per-endpoint circuit breakers**
//! - **A deferred queue** that parks rate-limited tenant requests and replays them by priority
//!   once the tenant has headroom
//!
//! All shared state lives behind [`AtomicStore`]; every bucket, counter and queue mutation is
//! one indivisible store operation. [`MemoryStore`] serves a single process and the
//! `tollgate-redis` crate serves a fleet.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate::{
//!     AdmissionController, InMemoryTenantDirectory, MemoryStore, RequestDescriptor, Tenant, Tier,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let directory = InMemoryTenantDirectory::with_tenants([Tenant::new("acme", Tier::Starter)]);
//! let controller = AdmissionController::builder()
//!     .store(Arc::new(MemoryStore::new()))
//!     .tenant_directory(Arc::new(directory))
//!     .build()?;
//!
//! let mut req = RequestDescriptor::new("GET", "/api/orders");
//! req.api_key = Some("sk_live_123".into());
//! req.tenant_header = Some("acme".into());
//!
//! let decision = controller.admit(&req).await?;
//! for (name, value) in decision.rate_limit_headers() {
//!     println!("{name}: {value}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod adaptive;
pub mod admission;
pub mod audit;
pub mod cache;
pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod policy;
pub mod queue;
pub mod rate_limit;
pub mod store;
pub mod threat;

#[cfg(test)]
mod testing;

// Re-exports
pub use adaptive::DynamicConfig;
pub use admission::{AdmissionController, AdmissionControllerBuilder, AdmissionDecision, BlockReason};
pub use audit::{AuditEvent, AuditSink, MemoryAuditSink, QueueOutcomeKind, TracingAuditSink};
pub use cache::{CacheConfig, ReadThroughCache};
pub use circuit_breaker::{CircuitBreaker, CircuitState, EndpointCircuitBreakers, NoopCircuitBreaker};
pub use classifier::{
    ClassifiedRequest, ClientIdentity, EndpointCategory, InMemoryTenantDirectory, Priority,
    RequestClassifier, RequestDescriptor, Tenant, TenantDirectory, Tier,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TollgateConfig;
pub use error::{
    AdmissionError, AuditError, ConfigError, DirectoryError, ExecutionError, InvalidQueueEntry,
    QueueError, ReputationError, StoreError,
};
pub use policy::{FixedLoad, LoadProbe, ResolvedLimits, TierPolicy};
pub use queue::{
    DeferredQueue, EnqueueOutcome, Executor, ProcessorReport, QueueEntry, QueueProcessor,
    ReplayRequest, ReplayResponse, ServiceExecutor, SweepReport,
};
pub use rate_limit::{AlgorithmBank, Scope, ScopeResult};
pub use store::{AtomicStore, BoundedPush, MemoryStore};
pub use threat::{ReputationSource, StaticReputation, ThreatAssessment, ThreatLevel, ThreatScorer};
