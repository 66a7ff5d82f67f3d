use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::{Algorithm, Scope, ScopeResult};
use crate::error::StoreError;
use crate::policy::{FixedLimit, WindowLimit};
use crate::store::AtomicStore;

/// A rate-limit algorithm bound to its resolved limits.
///
/// `check` performs exactly one atomic store operation; the returned result's `scope` is filled in
/// by the caller.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Algorithm identifier.
    fn algorithm(&self) -> Algorithm;

    /// Configured limit, reported as `remaining` when failing open.
    fn limit(&self) -> u64;

    /// Evaluate and record one request at `key`.
    async fn check(
        &self,
        store: &dyn AtomicStore,
        key: &str,
        now_ms: u64,
    ) -> Result<ScopeResult, StoreError>;
}

/// Token bucket refilled at `capacity` tokens per minute; each request costs `cost`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    /// Bucket size.
    pub capacity: f64,
    /// Tokens per request (priority-weighted).
    pub cost: f64,
}

impl TokenBucket {
    // A bucket idle for a full minute is full again, so dropping it after two is lossless.
    const TTL: Duration = Duration::from_secs(120);

    fn rate_per_sec(&self) -> f64 {
        self.capacity / 60.0
    }
}

#[async_trait]
impl Strategy for TokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn limit(&self) -> u64 {
        self.capacity.floor() as u64
    }

    async fn check(
        &self,
        store: &dyn AtomicStore,
        key: &str,
        now_ms: u64,
    ) -> Result<ScopeResult, StoreError> {
        let out = store.token_bucket(key, self.capacity, self.cost, now_ms, Self::TTL).await?;
        let rate = self.rate_per_sec();
        let full_in = (self.capacity - out.tokens).max(0.0) / rate;
        let retry_after =
            if out.allowed { 0 } else { (((self.cost - out.tokens) / rate).ceil() as u64).max(1) };
        let mut metadata = HashMap::new();
        metadata.insert("tokens".to_string(), format!("{:.3}", out.tokens));
        metadata.insert("cost".to_string(), format!("{:.2}", self.cost));
        Ok(ScopeResult {
            scope: Scope::User,
            algorithm: Algorithm::TokenBucket,
            key: key.to_string(),
            allowed: out.allowed,
            remaining: out.tokens.floor().max(0.0) as u64,
            limit: self.limit(),
            reset_time: ceil_secs(now_ms as f64 + full_in * 1000.0),
            retry_after,
            metadata,
            fail_open: false,
        })
    }
}

/// Sliding log with a burst sub-window; only admitted requests are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow(pub WindowLimit);

#[async_trait]
impl Strategy for SlidingWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    fn limit(&self) -> u64 {
        self.0.limit
    }

    async fn check(
        &self,
        store: &dyn AtomicStore,
        key: &str,
        now_ms: u64,
    ) -> Result<ScopeResult, StoreError> {
        let limits = &self.0;
        let window_ms = millis(limits.window);
        let burst_window_ms = millis(limits.burst_window);
        let out = store
            .sliding_window(key, limits.limit, limits.burst, window_ms, burst_window_ms, now_ms)
            .await?;
        let reset_ms = out.oldest_ms.unwrap_or(now_ms).saturating_add(window_ms);
        let retry_after = if out.allowed {
            0
        } else if out.count >= limits.limit {
            ceil_secs(reset_ms.saturating_sub(now_ms) as f64).max(1)
        } else {
            ceil_secs(burst_window_ms as f64).max(1)
        };
        let mut metadata = HashMap::new();
        metadata.insert("burst_count".to_string(), out.burst_count.to_string());
        metadata.insert("burst_limit".to_string(), limits.burst.to_string());
        Ok(ScopeResult {
            scope: Scope::Endpoint,
            algorithm: Algorithm::SlidingWindow,
            key: key.to_string(),
            allowed: out.allowed,
            remaining: limits.limit.saturating_sub(out.count),
            limit: limits.limit,
            reset_time: ceil_secs(reset_ms as f64),
            retry_after,
            metadata,
            fail_open: false,
        })
    }
}

/// Counter per aligned window; the increment happens even when the request is denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow(pub FixedLimit);

impl FixedWindow {
    /// Store key for the window containing `now_ms`, and the window's end.
    pub fn window_key(&self, key: &str, now_ms: u64) -> (String, u64) {
        let window_ms = millis(self.0.window).max(1);
        let index = now_ms / window_ms;
        (format!("{key}:{index}"), (index + 1) * window_ms)
    }
}

#[async_trait]
impl Strategy for FixedWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    fn limit(&self) -> u64 {
        self.0.limit
    }

    async fn check(
        &self,
        store: &dyn AtomicStore,
        key: &str,
        now_ms: u64,
    ) -> Result<ScopeResult, StoreError> {
        let (window_key, end_ms) = self.window_key(key, now_ms);
        let count = store.incr(&window_key, self.0.window + self.0.buffer).await?;
        let allowed = count <= self.0.limit;
        let retry_after =
            if allowed { 0 } else { ceil_secs(end_ms.saturating_sub(now_ms) as f64).max(1) };
        let mut metadata = HashMap::new();
        metadata.insert("count".to_string(), count.to_string());
        Ok(ScopeResult {
            scope: Scope::Global,
            algorithm: Algorithm::FixedWindow,
            key: window_key,
            allowed,
            remaining: self.0.limit.saturating_sub(count),
            limit: self.0.limit,
            reset_time: end_ms / 1000,
            retry_after,
            metadata,
            fail_open: false,
        })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Milliseconds to whole seconds, rounding up.
fn ceil_secs(ms: f64) -> u64 {
    (ms / 1000.0).ceil().max(0.0) as u64
}
