//! Rate limiting primitives.
//!
//! - [`strategies`]: the algorithms (token bucket, sliding window, fixed window), each a single
//!   atomic store operation.
//! - [`AlgorithmBank`]: runs a strategy against one scope key and folds store outages into a
//!   fail-open [`ScopeResult`].
//!
//! State lives in an [`AtomicStore`](crate::store::AtomicStore) under `scope:identifier` keys, so
//! every process sharing the store enforces the same limits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::store::AtomicStore;

pub mod strategies;
pub use strategies::{FixedWindow, SlidingWindow, Strategy, TokenBucket};

/// Limit scope a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One client.
    User,
    /// One tenant.
    Organization,
    /// One client on one endpoint category.
    Endpoint,
    /// The whole platform.
    Global,
}

impl Scope {
    /// Lowercase name, also the key prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Organization => "organization",
            Scope::Endpoint => "endpoint",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Algorithm that produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Lazily refilled bucket with priority-weighted cost.
    TokenBucket,
    /// Timestamp log with a burst sub-window.
    SlidingWindow,
    /// Counter per aligned window.
    FixedWindow,
    /// Scope did not apply to this request.
    Skipped,
}

impl Algorithm {
    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::Skipped => "skipped",
        }
    }
}

/// Outcome of one scope evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeResult {
    /// Scope evaluated.
    pub scope: Scope,
    /// Algorithm used.
    pub algorithm: Algorithm,
    /// Store key.
    pub key: String,
    /// Whether this scope admits the request.
    pub allowed: bool,
    /// Requests left in the current window or bucket.
    pub remaining: u64,
    /// Configured limit.
    pub limit: u64,
    /// Epoch seconds at which the scope is fully replenished.
    pub reset_time: u64,
    /// Seconds to wait before retrying; `0` when allowed.
    pub retry_after: u64,
    /// Algorithm-specific details.
    pub metadata: HashMap<String, String>,
    /// The store was unavailable and the scope allowed by default.
    pub fail_open: bool,
}

impl ScopeResult {
    /// Allowed result for a scope that does not apply (organization without a tenant).
    pub fn skipped(scope: Scope, reason: &str, now_ms: u64) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("skipped".to_string(), reason.to_string());
        Self {
            scope,
            algorithm: Algorithm::Skipped,
            key: String::new(),
            allowed: true,
            remaining: 0,
            limit: 0,
            reset_time: now_ms / 1000,
            retry_after: 0,
            metadata,
            fail_open: false,
        }
    }
}

/// Runs rate-limit strategies against the shared store.
#[derive(Debug, Clone)]
pub struct AlgorithmBank {
    store: Arc<dyn AtomicStore>,
}

impl AlgorithmBank {
    /// Bank over `store`.
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn AtomicStore> {
        &self.store
    }

    /// Evaluate `strategy` for `scope` at `key`. Store failures allow the request and set
    /// `fail_open`.
    pub async fn evaluate(
        &self,
        scope: Scope,
        key: &str,
        strategy: &dyn Strategy,
        now_ms: u64,
    ) -> ScopeResult {
        match strategy.check(self.store.as_ref(), key, now_ms).await {
            Ok(mut result) => {
                result.scope = scope;
                debug!(
                    target: "tollgate::rate_limit",
                    scope = scope.as_str(),
                    key,
                    algorithm = result.algorithm.as_str(),
                    allowed = result.allowed,
                    remaining = result.remaining,
                    limit = result.limit,
                    "scope evaluated"
                );
                result
            }
            Err(err) => {
                error!(
                    target: "tollgate::store",
                    scope = scope.as_str(),
                    key,
                    error = %err,
                    "rate limit store unavailable; failing open"
                );
                fail_open(scope, strategy, key, now_ms, &err)
            }
        }
    }

    /// Refilled tokens in a bucket without consuming any.
    pub async fn peek_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        now_ms: u64,
    ) -> Result<f64, StoreError> {
        self.store.peek_token_bucket(key, capacity, now_ms).await
    }
}

fn fail_open(
    scope: Scope,
    strategy: &dyn Strategy,
    key: &str,
    now_ms: u64,
    err: &StoreError,
) -> ScopeResult {
    let mut metadata = HashMap::new();
    metadata.insert("error".to_string(), err.to_string());
    ScopeResult {
        scope,
        algorithm: strategy.algorithm(),
        key: key.to_string(),
        allowed: true,
        remaining: strategy.limit(),
        limit: strategy.limit(),
        reset_time: now_ms / 1000,
        retry_after: 0,
        metadata,
        fail_open: true,
    }
}
