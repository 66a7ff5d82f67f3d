//! Deferred request queue.
//!
//! Requests rejected by the rate limiter can be parked per tenant and replayed later by the
//! [`QueueProcessor`]. Each tenant owns one priority set at `queue:{tenant}` whose members are
//! JSON-encoded [`QueueEntry`] values scored
//!
//! ```text
//! score = (priority + min(retry_count, max_retry_penalty)) * 10^13 + queued_at_ms
//! ```
//!
//! so a lower priority score always wins and equal scores keep arrival order. Claiming moves
//! entries into a lease set; leases that are never acknowledged return to the queue on the next
//! sweep, so delivery is at-least-once.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adaptive::DynamicConfig;
use crate::classifier::{ClassifiedRequest, Priority, RequestDescriptor};
use crate::clock::Clock;
use crate::config::{ProcessorConfig, TollgateConfig};
use crate::error::{InvalidQueueEntry, QueueError};
use crate::store::{AtomicStore, BoundedPush};

pub mod backoff;
pub mod executor;
pub mod processor;

pub use backoff::RetryBackoff;
pub use executor::{Executor, ReplayRequest, ReplayResponse, ServiceExecutor};
pub use processor::{ProcessorReport, QueueProcessor, SweepReport};

const QUEUE_PREFIX: &str = "queue:";
const SCORE_SCALE: u64 = 10_000_000_000_000;

/// Store key of a tenant's queue.
pub fn queue_key(tenant: &str) -> String {
    format!("{QUEUE_PREFIX}{tenant}")
}

/// Lifecycle of a deferred entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting to be claimed.
    #[default]
    Pending,
    /// Claimed by a processor.
    Processing,
    /// Replayed successfully.
    Completed,
    /// Out of retries.
    Failed,
    /// Aged out before replay.
    Expired,
}

/// What is kept of a request so it can be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    /// HTTP method.
    pub method: String,
    /// Path including query.
    pub path: String,
    /// Lowercase header map.
    pub headers: HashMap<String, String>,
    /// Base64-encoded body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Peer address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

impl RequestSnapshot {
    /// Capture `req`.
    pub fn capture(req: &RequestDescriptor) -> Self {
        Self {
            method: req.method.clone(),
            path: req.path.clone(),
            headers: req.headers.clone(),
            body: req.body.as_deref().map(|b| STANDARD.encode(b)),
            ip: req.ip,
        }
    }

    /// Decoded body bytes.
    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.body.as_deref().map(|b| STANDARD.decode(b)).transpose()
    }
}

/// One deferred request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique id.
    pub id: String,
    /// Client identity at enqueue time.
    pub client_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Replayable request.
    pub request: RequestSnapshot,
    /// Priority at enqueue time.
    pub priority: Priority,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Epoch milliseconds of the original enqueue.
    pub queued_at_ms: u64,
    /// Not claimable before this instant.
    pub next_retry_at_ms: u64,
    /// Lifecycle state.
    pub state: EntryState,
    /// Last replay failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueEntry {
    /// New pending entry for `classified`, due immediately.
    pub fn new(
        classified: &ClassifiedRequest,
        tenant_id: &str,
        req: &RequestDescriptor,
        now_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_id: classified.client.to_string(),
            tenant_id: tenant_id.to_string(),
            request: RequestSnapshot::capture(req),
            priority: classified.queue_priority(),
            retry_count: 0,
            queued_at_ms: now_ms,
            next_retry_at_ms: now_ms,
            state: EntryState::Pending,
            last_error: None,
        }
    }

    /// `priority + min(retry_count, max_penalty)`; lower runs first.
    pub fn priority_score(&self, max_penalty: u32) -> u64 {
        u64::from(self.priority.value()) + u64::from(self.retry_count.min(max_penalty))
    }

    /// Score stored in the priority set.
    pub fn store_score(&self, max_penalty: u32) -> u64 {
        self.priority_score(max_penalty)
            .saturating_mul(SCORE_SCALE)
            .saturating_add(self.queued_at_ms % SCORE_SCALE)
    }

    /// Whether the entry has waited longer than `max_queue_time`.
    pub fn is_expired(&self, now_ms: u64, max_queue_time: Duration) -> bool {
        let max = u64::try_from(max_queue_time.as_millis()).unwrap_or(u64::MAX);
        now_ms.saturating_sub(self.queued_at_ms) > max
    }

    /// JSON member stored in the queue.
    pub fn encode(&self) -> Result<String, InvalidQueueEntry> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored member.
    pub fn decode(member: &str) -> Result<Self, InvalidQueueEntry> {
        Ok(serde_json::from_str(member)?)
    }
}

/// Result of [`DeferredQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Parked for later replay.
    Queued {
        /// Entry id.
        id: String,
        /// 1-based position among pending entries.
        position: usize,
    },
    /// Tenant queue at or above the occupancy limit.
    Full {
        /// Entries currently held.
        occupancy: usize,
        /// Tier capacity.
        capacity: usize,
    },
    /// Deferral turned off in configuration.
    Disabled,
}

/// Result of [`DeferredQueue::fail`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Re-enqueued with a penalized score.
    Retried {
        /// Updated entry.
        entry: QueueEntry,
        /// Delay before the entry becomes claimable again.
        delay: Duration,
    },
    /// Out of attempts and removed.
    DeadLettered(QueueEntry),
}

/// A claimed member and its decoded entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedEntry {
    /// Raw stored member; needed to acknowledge.
    pub member: String,
    /// Decoded entry, state `Processing`.
    pub entry: QueueEntry,
}

/// A claimed member that could not be decoded. It has already been acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEntry {
    /// Entry id when recoverable from the payload.
    pub id: Option<String>,
    /// Client id when recoverable from the payload.
    pub client_id: Option<String>,
    /// Decode failure.
    pub error: String,
}

/// Entries claimed in one call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Claim {
    /// Decoded entries, lowest score first.
    pub entries: Vec<ClaimedEntry>,
    /// Undecodable entries, dropped.
    pub malformed: Vec<MalformedEntry>,
}

/// Per-tenant priority queues over the shared store.
#[derive(Debug, Clone)]
pub struct DeferredQueue {
    store: Arc<dyn AtomicStore>,
    config: DynamicConfig<TollgateConfig>,
    clock: Arc<dyn Clock>,
}

impl DeferredQueue {
    /// Queue reading `config.queue` on every call.
    pub fn new(
        store: Arc<dyn AtomicStore>,
        config: DynamicConfig<TollgateConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, config, clock }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn AtomicStore> {
        &self.store
    }

    pub(crate) fn settings(&self) -> Arc<TollgateConfig> {
        self.config.get()
    }

    /// Park `req` for `classified.tenant` unless occupancy has reached the limit.
    pub async fn enqueue(
        &self,
        classified: &ClassifiedRequest,
        tenant_id: &str,
        req: &RequestDescriptor,
        capacity: usize,
    ) -> Result<EnqueueOutcome, QueueError> {
        let cfg = self.config.get();
        if !cfg.queue.enabled || capacity == 0 {
            return Ok(EnqueueOutcome::Disabled);
        }
        let key = queue_key(tenant_id);
        let limit = occupancy_limit(cfg.queue.occupancy_limit, capacity);
        let now = self.clock.now_millis();
        let entry = QueueEntry::new(classified, tenant_id, req, now);
        let member = entry.encode()?;
        let pushed = self
            .store
            .queue_push_bounded(
                &key,
                &member,
                entry.store_score(cfg.queue.max_retry_penalty),
                entry.next_retry_at_ms,
                cfg.queue.max_queue_time(),
                limit,
            )
            .await?;
        let position = match pushed {
            BoundedPush::Queued { position } => position,
            BoundedPush::Full { occupancy } => {
                warn!(
                    target: "tollgate::queue",
                    tenant = tenant_id,
                    occupancy,
                    capacity,
                    "deferred queue full"
                );
                return Ok(EnqueueOutcome::Full { occupancy, capacity });
            }
        };
        debug!(
            target: "tollgate::queue",
            tenant = tenant_id,
            id = %entry.id,
            priority = entry.priority.as_str(),
            position,
            "request deferred"
        );
        Ok(EnqueueOutcome::Queued { id: entry.id, position })
    }

    /// Claim up to `max` due entries for `tenant`. Undecodable members are acknowledged and
    /// reported in [`Claim::malformed`].
    pub async fn claim(&self, tenant: &str, max: usize) -> Result<Claim, QueueError> {
        let cfg = self.config.get();
        let key = queue_key(tenant);
        let lease_ms = cfg.queue.lease_timeout_secs.saturating_mul(1000);
        let items = self.store.queue_claim(&key, max, self.clock.now_millis(), lease_ms).await?;

        let mut claim = Claim::default();
        for item in items {
            match QueueEntry::decode(&item.member) {
                Ok(mut entry) => {
                    entry.state = EntryState::Processing;
                    claim.entries.push(ClaimedEntry { member: item.member, entry });
                }
                Err(err) => {
                    warn!(target: "tollgate::queue", tenant, error = %err, "dropping malformed queue entry");
                    self.store.queue_ack(&key, &item.member).await?;
                    claim.malformed.push(salvage(&item.member, &err));
                }
            }
        }
        Ok(claim)
    }

    /// Acknowledge a claimed entry (completed or expired).
    pub async fn ack(&self, claimed: &ClaimedEntry) -> Result<bool, QueueError> {
        Ok(self.store.queue_ack(&queue_key(&claimed.entry.tenant_id), &claimed.member).await?)
    }

    /// Record a failed replay: re-enqueue with backoff while attempts remain, otherwise remove.
    pub async fn fail(
        &self,
        claimed: ClaimedEntry,
        error: String,
    ) -> Result<FailOutcome, QueueError> {
        let cfg = self.config.get();
        let key = queue_key(&claimed.entry.tenant_id);
        let mut entry = claimed.entry;
        entry.last_error = Some(error);

        if entry.retry_count + 1 >= cfg.queue.max_retry_attempts {
            entry.retry_count += 1;
            entry.state = EntryState::Failed;
            self.store.queue_ack(&key, &claimed.member).await?;
            return Ok(FailOutcome::DeadLettered(entry));
        }

        entry.retry_count += 1;
        let delay = RetryBackoff::from_config(&cfg.queue).delay(entry.retry_count);
        let now = self.clock.now_millis();
        entry.next_retry_at_ms = now.saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        entry.state = EntryState::Pending;
        let member = entry.encode()?;
        // Push before ack: a crash in between duplicates the entry rather than losing it.
        self.store
            .queue_push(
                &key,
                &member,
                entry.store_score(cfg.queue.max_retry_penalty),
                entry.next_retry_at_ms,
                cfg.queue.max_queue_time(),
            )
            .await?;
        self.store.queue_ack(&key, &claimed.member).await?;
        Ok(FailOutcome::Retried { entry, delay })
    }

    /// Entries held for `tenant` (pending and in flight).
    pub async fn len(&self, tenant: &str) -> Result<usize, QueueError> {
        Ok(self.store.queue_len(&queue_key(tenant)).await?)
    }

    /// Pending entries for `tenant` in claim order. Malformed members are skipped.
    pub async fn pending(&self, tenant: &str) -> Result<Vec<QueueEntry>, QueueError> {
        let items = self.store.queue_members(&queue_key(tenant)).await?;
        Ok(items.iter().filter_map(|i| QueueEntry::decode(&i.member).ok()).collect())
    }

    /// Tenants with a non-empty queue.
    pub async fn tenants(&self) -> Result<Vec<String>, QueueError> {
        let names = self.store.queue_names().await?;
        Ok(names
            .into_iter()
            .filter_map(|n| n.strip_prefix(QUEUE_PREFIX).map(str::to_string))
            .collect())
    }

    /// Return stale leases for `tenant` to the pending set, then remove expired and malformed
    /// pending entries. Returns `(recovered, expired, malformed)`.
    pub(crate) async fn sweep_tenant(
        &self,
        tenant: &str,
    ) -> Result<(usize, Vec<QueueEntry>, Vec<MalformedEntry>), QueueError> {
        let cfg = self.config.get();
        let key = queue_key(tenant);
        let now = self.clock.now_millis();
        let recovered = self.store.queue_recover_leases(&key, now).await?;

        let mut expired = Vec::new();
        let mut malformed = Vec::new();
        for item in self.store.queue_members(&key).await? {
            match QueueEntry::decode(&item.member) {
                Ok(mut entry) if entry.is_expired(now, cfg.queue.max_queue_time()) => {
                    if self.store.queue_remove(&key, &item.member).await? {
                        entry.state = EntryState::Expired;
                        expired.push(entry);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if self.store.queue_remove(&key, &item.member).await? {
                        warn!(target: "tollgate::queue", tenant, error = %err, "swept malformed queue entry");
                        malformed.push(salvage(&item.member, &err));
                    }
                }
            }
        }
        Ok((recovered, expired, malformed))
    }
}

/// Rough seconds until the entry at `position` is replayed.
pub fn estimate_wait_seconds(position: usize, processor: &ProcessorConfig) -> u64 {
    let batches = position.div_ceil(processor.batch_size.max(1)) as u64;
    let interval_ms = batches.saturating_mul(processor.interval_ms);
    interval_ms.div_ceil(1000).max(1)
}

/// Smallest occupancy at which `fraction` of `capacity` is reached.
fn occupancy_limit(fraction: f64, capacity: usize) -> usize {
    let limit = (fraction * capacity as f64).ceil();
    if limit <= 0.0 {
        0
    } else {
        limit as usize
    }
}

fn salvage(member: &str, err: &InvalidQueueEntry) -> MalformedEntry {
    let value: Option<serde_json::Value> = serde_json::from_str(member).ok();
    let field = |name: &str| {
        value.as_ref().and_then(|v| v.get(name)).and_then(|v| v.as_str()).map(str::to_string)
    };
    MalformedEntry { id: field("id"), client_id: field("client_id"), error: err.to_string() }
}
