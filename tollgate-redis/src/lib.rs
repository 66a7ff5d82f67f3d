//! Redis-backed [`AtomicStore`] for `tollgate` (companion crate).
//!
//! Lets every process in a fleet share rate-limit buckets, threat counters, feature statistics
//! and deferred queues. Each multi-step operation runs as one Lua script (sent by SHA, loaded on
//! first miss), so no two processes ever observe a half-applied update.
//!
//! ## Key layout
//!
//! Every key is prefixed with [`RedisStoreConfig::key_prefix`]. A deferred queue `queue:acme`
//! becomes four keys sharing a hash tag, so the queue stays on one cluster slot:
//!
//! - `{prefix}{queue:acme}:pending`: sorted set, member to score
//! - `{prefix}{queue:acme}:due`: hash, member to earliest claim time
//! - `{prefix}{queue:acme}:inflight`: hash, member to claimed score and claim time
//! - `{prefix}{queue:acme}:leases`: sorted set, member to lease expiry
//!
//! Pending members with equal scores are claimed in member order rather than arrival order.
//!
//! ## Errors
//!
//! Connection and I/O failures map to [`StoreError::Unavailable`]; replies that do not parse map
//! to [`StoreError::Protocol`]. The admission pipeline fails open on either.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tollgate::{AdmissionController, InMemoryTenantDirectory};
//! use tollgate_redis::RedisStore;
//!
//! let store = RedisStore::connect("redis://127.0.0.1/").await?;
//! let controller = AdmissionController::builder()
//!     .store(Arc::new(store))
//!     .tenant_directory(Arc::new(InMemoryTenantDirectory::new()))
//!     .build()?;
//! ```

mod scripts;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError};
use tollgate::store::{
    BoundedPush, FeatureStat, QueueItem, SlidingWindowOutcome, TokenBucketOutcome,
};
use tollgate::{AtomicStore, StoreError};
use tracing::debug;

use crate::scripts::Scripts;

/// Configuration for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prepended to every key (default: `"tollgate:"`).
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self { key_prefix: "tollgate:".to_string() }
    }
}

/// Shared admission state in Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    scripts: std::sync::Arc<Scripts>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with the default configuration.
    ///
    /// # Errors
    /// Returns the client error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect with a custom key prefix.
    ///
    /// # Errors
    /// Returns the client error if the URL is invalid or the first connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(connection, config))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager, config: RedisStoreConfig) -> Self {
        Self { connection, config, scripts: std::sync::Arc::new(Scripts::new()) }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.config.key_prefix)
    }

    fn queue_keys(&self, queue: &str) -> [String; 4] {
        queue_keys(&self.config.key_prefix, queue)
    }

    fn registry_key(&self) -> String {
        self.key("queues")
    }

    async fn push(
        &self,
        queue: &str,
        member: &str,
        score: u64,
        not_before_ms: u64,
        ttl: Duration,
        limit: i64,
    ) -> Result<BoundedPush, StoreError> {
        let mut conn = self.connection.clone();
        let [pending, due, inflight, leases] = self.queue_keys(queue);
        let reply: Vec<i64> = self
            .scripts
            .queue_push
            .key(pending)
            .key(due)
            .key(inflight)
            .key(leases)
            .key(self.registry_key())
            .arg(member)
            .arg(score)
            .arg(not_before_ms)
            .arg(millis(ttl))
            .arg(queue)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        push_outcome(&reply)
    }
}

fn queue_keys(prefix: &str, queue: &str) -> [String; 4] {
    let tag = format!("{prefix}{{{queue}}}");
    [
        format!("{tag}:pending"),
        format!("{tag}:due"),
        format!("{tag}:inflight"),
        format!("{tag}:leases"),
    ]
}

fn store_error(err: RedisError) -> StoreError {
    match err.kind() {
        ErrorKind::TypeError | ErrorKind::ResponseError | ErrorKind::ExtensionError => {
            StoreError::Protocol(err.to_string())
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn parse_f64(raw: &str) -> Result<f64, StoreError> {
    raw.parse().map_err(|_| StoreError::Protocol(format!("expected a number, got '{raw}'")))
}

fn parse_score(raw: &str) -> Result<u64, StoreError> {
    raw.parse::<u64>().or_else(|_| parse_f64(raw).map(|f| f as u64))
}

fn push_outcome(reply: &[i64]) -> Result<BoundedPush, StoreError> {
    let count = |n: i64| {
        usize::try_from(n).map_err(|_| StoreError::Protocol(format!("negative queue count {n}")))
    };
    match reply {
        [1, position] => Ok(BoundedPush::Queued { position: count(*position)? }),
        [0, occupancy] => Ok(BoundedPush::Full { occupancy: count(*occupancy)? }),
        other => Err(StoreError::Protocol(format!("unexpected push reply {other:?}"))),
    }
}

fn queue_items(flat: Vec<String>) -> Result<Vec<QueueItem>, StoreError> {
    flat.chunks(2)
        .map(|pair| match pair {
            [member, score] => Ok(QueueItem { member: member.clone(), score: parse_score(score)? }),
            _ => Err(StoreError::Protocol("odd-length member/score reply".into())),
        })
        .collect()
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn token_bucket(
        &self,
        key: &str,
        capacity: f64,
        cost: f64,
        now_ms: u64,
        ttl: Duration,
    ) -> Result<TokenBucketOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let (allowed, tokens): (i64, String) = self
            .scripts
            .token_bucket
            .key(self.key(key))
            .arg(capacity)
            .arg(cost)
            .arg(now_ms)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(TokenBucketOutcome { allowed: allowed == 1, tokens: parse_f64(&tokens)? })
    }

    async fn peek_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        now_ms: u64,
    ) -> Result<f64, StoreError> {
        let mut conn = self.connection.clone();
        let tokens: String = self
            .scripts
            .peek_token_bucket
            .key(self.key(key))
            .arg(capacity)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        parse_f64(&tokens)
    }

    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        burst: u64,
        window_ms: u64,
        burst_window_ms: u64,
        now_ms: u64,
    ) -> Result<SlidingWindowOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let (allowed, count, burst_count, oldest): (i64, u64, u64, String) = self
            .scripts
            .sliding_window
            .key(self.key(key))
            .arg(limit)
            .arg(burst)
            .arg(window_ms.max(1))
            .arg(burst_window_ms)
            .arg(now_ms)
            .arg(uuid::Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        let oldest_ms = if oldest.is_empty() { None } else { Some(parse_score(&oldest)?) };
        Ok(SlidingWindowOutcome { allowed: allowed == 1, count, burst_count, oldest_ms })
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        self.scripts
            .incr
            .key(self.key(key))
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn count_events(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        record: bool,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        self.scripts
            .count_events
            .key(self.key(key))
            .arg(now_ms)
            .arg(window_ms.max(1))
            .arg(if record { "1" } else { "0" })
            .arg(uuid::Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn push_recent(
        &self,
        key: &str,
        value: String,
        max_len: usize,
        ttl: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        self.scripts
            .push_recent
            .key(self.key(key))
            .arg(value)
            .arg(max_len.max(1))
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(1)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn flag_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.connection.clone();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        // -2: missing, -1: no expiry.
        Ok(u64::try_from(ttl).ok().map(Duration::from_millis))
    }

    async fn stat_get(&self, name: &str) -> Result<Option<FeatureStat>, StoreError> {
        let mut conn = self.connection.clone();
        let (count, sum, sum_of_squares): (Option<u64>, Option<String>, Option<String>) =
            redis::cmd("HMGET")
                .arg(self.key(name))
                .arg("count")
                .arg("sum")
                .arg("sum_of_squares")
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;
        let Some(count) = count else {
            return Ok(None);
        };
        Ok(Some(FeatureStat {
            count,
            sum: sum.as_deref().map(parse_f64).transpose()?.unwrap_or(0.0),
            sum_of_squares: sum_of_squares.as_deref().map(parse_f64).transpose()?.unwrap_or(0.0),
        }))
    }

    async fn stat_add(&self, name: &str, value: f64, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .scripts
            .stat_add
            .key(self.key(name))
            .arg(value)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn queue_push(
        &self,
        queue: &str,
        member: &str,
        score: u64,
        not_before_ms: u64,
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        match self.push(queue, member, score, not_before_ms, ttl, -1).await? {
            BoundedPush::Queued { position } => Ok(position),
            BoundedPush::Full { .. } => {
                Err(StoreError::Protocol("unbounded push reported a full queue".into()))
            }
        }
    }

    async fn queue_push_bounded(
        &self,
        queue: &str,
        member: &str,
        score: u64,
        not_before_ms: u64,
        ttl: Duration,
        limit: usize,
    ) -> Result<BoundedPush, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.push(queue, member, score, not_before_ms, ttl, limit).await
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection.clone();
        let [pending, due, inflight, leases] = self.queue_keys(queue);
        self.scripts
            .queue_len
            .key(pending)
            .key(due)
            .key(inflight)
            .key(leases)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn queue_claim(
        &self,
        queue: &str,
        max: usize,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let [pending, due, inflight, leases] = self.queue_keys(queue);
        let flat: Vec<String> = self
            .scripts
            .queue_claim
            .key(pending)
            .key(due)
            .key(inflight)
            .key(leases)
            .arg(max)
            .arg(now_ms)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        queue_items(flat)
    }

    async fn queue_ack(&self, queue: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let [pending, due, inflight, leases] = self.queue_keys(queue);
        let removed: i64 = self
            .scripts
            .queue_ack
            .key(pending)
            .key(due)
            .key(inflight)
            .key(leases)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn queue_members(&self, queue: &str) -> Result<Vec<QueueItem>, StoreError> {
        let mut conn = self.connection.clone();
        let [pending, ..] = self.queue_keys(queue);
        let flat: Vec<String> = redis::cmd("ZRANGE")
            .arg(pending)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        queue_items(flat)
    }

    async fn queue_remove(&self, queue: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let [pending, due, inflight, leases] = self.queue_keys(queue);
        let removed: i64 = self
            .scripts
            .queue_remove
            .key(pending)
            .key(due)
            .key(inflight)
            .key(leases)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn queue_recover_leases(&self, queue: &str, now_ms: u64) -> Result<usize, StoreError> {
        let mut conn = self.connection.clone();
        let [pending, due, inflight, leases] = self.queue_keys(queue);
        self.scripts
            .queue_recover
            .key(pending)
            .key(due)
            .key(inflight)
            .key(leases)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)
    }

    /// Registered queue names with at least one member. Names whose keys have all expired are
    /// pruned from the registry as a side effect.
    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let registry = self.registry_key();
        let names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&registry)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        let mut live = Vec::with_capacity(names.len());
        for name in names {
            let [pending, due, inflight, leases] = self.queue_keys(&name);
            let held: i64 = self
                .scripts
                .queue_prune
                .key(pending)
                .key(due)
                .key(inflight)
                .key(leases)
                .key(&registry)
                .arg(&name)
                .invoke_async(&mut conn)
                .await
                .map_err(store_error)?;
            if held > 0 {
                live.push(name);
            } else {
                debug!(target: "tollgate::store", queue = %name, "pruned empty queue from registry");
            }
        }
        live.sort();
        Ok(live)
    }
}
