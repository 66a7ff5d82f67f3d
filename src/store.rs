//! Shared atomic store abstraction.
//!
//! Every rate-limit bucket, threat counter, feature statistic, and deferred queue lives behind
//! [`AtomicStore`]. Each method is one indivisible read-modify-write: two processes evaluating
//! the same key concurrently must never both observe the pre-decrement state. Backends honor
//! this with their native facility:
//!
//! - [`MemoryStore`] runs every operation under a single mutex (single process).
//! - `tollgate-redis` runs every operation as one Lua script (many processes).
//!
//! Callers never compose a read and a write into two round trips.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub mod memory;
pub use memory::MemoryStore;

/// Result of one token-bucket acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketOutcome {
    /// Whether `cost` was deducted.
    pub allowed: bool,
    /// Tokens left after refill (and deduction when allowed).
    pub tokens: f64,
}

/// Result of one sliding-window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowOutcome {
    /// Whether the request timestamp was recorded.
    pub allowed: bool,
    /// Entries inside the full window after evaluation.
    pub count: u64,
    /// Entries inside the burst sub-window after evaluation.
    pub burst_count: u64,
    /// Oldest timestamp still inside the window.
    pub oldest_ms: Option<u64>,
}

/// Online accumulator for one numeric feature.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FeatureStat {
    /// Number of samples.
    pub count: u64,
    /// Sum of samples.
    pub sum: f64,
    /// Sum of squared samples.
    pub sum_of_squares: f64,
}

impl FeatureStat {
    /// Mean of the samples, `0.0` when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population variance, clamped at zero against rounding.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_of_squares / self.count as f64 - mean * mean).max(0.0)
    }

    /// Population standard deviation.
    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Queue member together with its ordering score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Opaque serialized payload.
    pub member: String,
    /// Lower scores are claimed first.
    pub score: u64,
}

/// Result of a capacity-bounded queue push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedPush {
    /// Inserted at this 1-based rank.
    Queued { position: usize },
    /// Refused; the queue already held `occupancy` members.
    Full { occupancy: usize },
}

/// Atomic operations over shared admission state.
#[async_trait]
pub trait AtomicStore: Send + Sync + std::fmt::Debug {
    /// Refill `key` lazily at `capacity` tokens per minute, then deduct `cost` if available.
    /// A missing bucket starts full.
    async fn token_bucket(
        &self,
        key: &str,
        capacity: f64,
        cost: f64,
        now_ms: u64,
        ttl: Duration,
    ) -> Result<TokenBucketOutcome, StoreError>;

    /// Refilled token count for `key` without deducting anything.
    async fn peek_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        now_ms: u64,
    ) -> Result<f64, StoreError>;

    /// Purge timestamps older than `window_ms`, then record `now_ms` iff the window holds fewer
    /// than `limit` entries and the last `burst_window_ms` fewer than `burst`.
    #[allow(clippy::too_many_arguments)]
    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        burst: u64,
        window_ms: u64,
        burst_window_ms: u64,
        now_ms: u64,
    ) -> Result<SlidingWindowOutcome, StoreError>;

    /// Increment a counter, setting `ttl` on creation; returns the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Count events in the trailing `window_ms`, optionally recording `now_ms` first.
    async fn count_events(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        record: bool,
    ) -> Result<u64, StoreError>;

    /// Append `value` to a capped list (oldest dropped) and return the list, oldest first.
    async fn push_recent(
        &self,
        key: &str,
        value: String,
        max_len: usize,
        ttl: Duration,
    ) -> Result<Vec<String>, StoreError>;

    /// Set a flag that expires after `ttl`.
    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remaining lifetime of a flag, `None` when absent.
    async fn flag_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Read a feature accumulator.
    async fn stat_get(&self, name: &str) -> Result<Option<FeatureStat>, StoreError>;

    /// Add one sample to a feature accumulator and refresh its TTL.
    async fn stat_add(&self, name: &str, value: f64, ttl: Duration) -> Result<(), StoreError>;

    /// Insert `member` into `queue`, refreshing the queue TTL. The member becomes claimable
    /// once `now >= not_before_ms`. Returns its 1-based position among pending members.
    async fn queue_push(
        &self,
        queue: &str,
        member: &str,
        score: u64,
        not_before_ms: u64,
        ttl: Duration,
    ) -> Result<usize, StoreError>;

    /// Same as [`queue_push`](Self::queue_push), but only while pending plus in-flight members
    /// number fewer than `limit`. The length check and the insert are one operation.
    async fn queue_push_bounded(
        &self,
        queue: &str,
        member: &str,
        score: u64,
        not_before_ms: u64,
        ttl: Duration,
        limit: usize,
    ) -> Result<BoundedPush, StoreError>;

    /// Pending plus in-flight members.
    async fn queue_len(&self, queue: &str) -> Result<usize, StoreError>;

    /// Move up to `max` due members, lowest score first, into the in-flight set with a lease
    /// ending at `now_ms + lease_ms`.
    async fn queue_claim(
        &self,
        queue: &str,
        max: usize,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Drop an in-flight member. Returns whether it was held.
    async fn queue_ack(&self, queue: &str, member: &str) -> Result<bool, StoreError>;

    /// Pending members, lowest score first.
    async fn queue_members(&self, queue: &str) -> Result<Vec<QueueItem>, StoreError>;

    /// Remove a pending member. Returns whether it was present.
    async fn queue_remove(&self, queue: &str, member: &str) -> Result<bool, StoreError>;

    /// Return in-flight members whose lease ended before `now_ms` to the pending set.
    async fn queue_recover_leases(&self, queue: &str, now_ms: u64) -> Result<usize, StoreError>;

    /// Names of queues that currently hold members.
    async fn queue_names(&self) -> Result<Vec<String>, StoreError>;
}
