//! Single-process [`AtomicStore`] backed by one mutex-guarded map.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{AtomicStore, BoundedPush, FeatureStat, QueueItem, SlidingWindowOutcome, TokenBucketOutcome};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

const PURGE_EVERY: u64 = 1024;

#[derive(Debug)]
enum Value {
    Bucket { tokens: f64, last_ms: u64 },
    Log(VecDeque<u64>),
    Counter(u64),
    List(VecDeque<String>),
    Flag,
    Stat(FeatureStat),
    Queue(MemQueue),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Bucket { .. } => "bucket",
            Value::Log(_) => "log",
            Value::Counter(_) => "counter",
            Value::List(_) => "list",
            Value::Flag => "flag",
            Value::Stat(_) => "stat",
            Value::Queue(_) => "queue",
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<u64>,
}

#[derive(Debug)]
struct Pending {
    member: String,
    not_before: u64,
}

#[derive(Debug)]
struct Leased {
    score: u64,
    not_before: u64,
    lease_until: u64,
}

#[derive(Debug, Default)]
struct MemQueue {
    // (score, insertion sequence) keeps equal scores in arrival order.
    pending: BTreeMap<(u64, u64), Pending>,
    index: HashMap<String, (u64, u64)>,
    inflight: HashMap<String, Leased>,
    seq: u64,
}

impl MemQueue {
    fn insert(&mut self, member: &str, score: u64, not_before: u64) -> (u64, u64) {
        if let Some(old) = self.index.remove(member) {
            self.pending.remove(&old);
        }
        self.seq += 1;
        let key = (score, self.seq);
        self.pending.insert(key, Pending { member: member.to_string(), not_before });
        self.index.insert(member.to_string(), key);
        key
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.inflight.is_empty()
    }
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<String, Slot>,
    ops: u64,
}

impl State {
    /// Live slot for `key`, dropping it first if its TTL has passed.
    fn live(&mut self, key: &str, now: u64) -> Option<&mut Slot> {
        if self.slots.get(key).is_some_and(|s| s.expires_at.is_some_and(|at| at <= now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn live_or_insert(&mut self, key: &str, now: u64, init: impl FnOnce() -> Value) -> &mut Slot {
        if self.slots.get(key).is_some_and(|s| s.expires_at.is_some_and(|at| at <= now)) {
            self.slots.remove(key);
        }
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| Slot { value: init(), expires_at: None })
    }

    fn queue_occupancy(&mut self, queue: &str, now: u64) -> Result<usize, StoreError> {
        match self.live(queue, now) {
            None => Ok(0),
            Some(Slot { value: Value::Queue(q), .. }) => Ok(q.pending.len() + q.inflight.len()),
            Some(slot) => Err(wrong_type(queue, &slot.value)),
        }
    }

    fn queue_push(
        &mut self,
        queue: &str,
        member: &str,
        score: u64,
        not_before_ms: u64,
        ttl: Duration,
        now: u64,
    ) -> Result<usize, StoreError> {
        let slot = self.live_or_insert(queue, now, || Value::Queue(MemQueue::default()));
        let Value::Queue(q) = &mut slot.value else {
            return Err(wrong_type(queue, &slot.value));
        };
        let key = q.insert(member, score, not_before_ms);
        let position = q.pending.range(..key).count() + 1;
        slot.expires_at = expiry(now, ttl);
        Ok(position)
    }

    fn purge(&mut self, now: u64) {
        self.ops += 1;
        if self.ops % PURGE_EVERY == 0 {
            self.slots.retain(|_, s| s.expires_at.map_or(true, |at| at > now));
        }
    }
}

fn wrong_type(key: &str, value: &Value) -> StoreError {
    StoreError::Protocol(format!("key '{key}' holds a {}", value.kind()))
}

fn expiry(now: u64, ttl: Duration) -> Option<u64> {
    Some(now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)))
}

fn refill(tokens: f64, last_ms: u64, capacity: f64, now_ms: u64) -> f64 {
    let elapsed_secs = now_ms.saturating_sub(last_ms) as f64 / 1000.0;
    (tokens + elapsed_secs / 60.0 * capacity).clamp(0.0, capacity)
}

fn trim_log(log: &mut VecDeque<u64>, now_ms: u64, window_ms: u64) {
    let Some(cutoff) = now_ms.checked_sub(window_ms) else {
        return;
    };
    while log.front().is_some_and(|&ts| ts <= cutoff) {
        log.pop_front();
    }
}

fn insert_sorted(log: &mut VecDeque<u64>, ts: u64) {
    let idx = log.partition_point(|&x| x <= ts);
    log.insert(idx, ts);
}

/// In-memory store; every operation runs under one lock, so each call is atomic.
///
/// Clones share state. TTLs are evaluated against the injected clock.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store driven by `clock` (useful for deterministic tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { state: Arc::new(Mutex::new(State::default())), clock }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().slots.values().filter(|s| s.expires_at.map_or(true, |at| at > now)).count()
    }

    /// Whether no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn guard(&self) -> (MutexGuard<'_, State>, u64) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        state.purge(now);
        (state, now)
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn token_bucket(
        &self,
        key: &str,
        capacity: f64,
        cost: f64,
        now_ms: u64,
        ttl: Duration,
    ) -> Result<TokenBucketOutcome, StoreError> {
        let (mut state, now) = self.guard();
        let slot =
            state.live_or_insert(key, now, || Value::Bucket { tokens: capacity, last_ms: now_ms });
        let Value::Bucket { tokens, last_ms } = &mut slot.value else {
            return Err(wrong_type(key, &slot.value));
        };
        let mut available = refill(*tokens, *last_ms, capacity, now_ms);
        let allowed = available >= cost;
        if allowed {
            available -= cost;
        }
        *tokens = available;
        *last_ms = (*last_ms).max(now_ms);
        slot.expires_at = expiry(now, ttl);
        Ok(TokenBucketOutcome { allowed, tokens: available })
    }

    async fn peek_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        now_ms: u64,
    ) -> Result<f64, StoreError> {
        let (mut state, now) = self.guard();
        match state.live(key, now) {
            None => Ok(capacity),
            Some(Slot { value: Value::Bucket { tokens, last_ms }, .. }) => {
                Ok(refill(*tokens, *last_ms, capacity, now_ms))
            }
            Some(slot) => Err(wrong_type(key, &slot.value)),
        }
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
        let (mut state, now) = self.guard();
        let slot = state.live_or_insert(key, now, || Value::Log(VecDeque::new()));
        let Value::Log(log) = &mut slot.value else {
            return Err(wrong_type(key, &slot.value));
        };
        trim_log(log, now_ms, window_ms);
        let burst_cutoff = now_ms.saturating_sub(burst_window_ms);
        let mut count = log.len() as u64;
        let mut burst_count = log.iter().filter(|&&ts| ts > burst_cutoff).count() as u64;
        let allowed = count < limit && burst_count < burst;
        if allowed {
            insert_sorted(log, now_ms);
            count += 1;
            burst_count += 1;
        }
        let oldest_ms = log.front().copied();
        slot.expires_at = expiry(now, Duration::from_millis(window_ms));
        Ok(SlidingWindowOutcome { allowed, count, burst_count, oldest_ms })
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let (mut state, now) = self.guard();
        let slot = state.live_or_insert(key, now, || Value::Counter(0));
        let Value::Counter(count) = &mut slot.value else {
            return Err(wrong_type(key, &slot.value));
        };
        *count += 1;
        let value = *count;
        if slot.expires_at.is_none() {
            slot.expires_at = expiry(now, ttl);
        }
        Ok(value)
    }

    async fn count_events(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        record: bool,
    ) -> Result<u64, StoreError> {
        let (mut state, now) = self.guard();
        if !record && state.live(key, now).is_none() {
            return Ok(0);
        }
        let slot = state.live_or_insert(key, now, || Value::Log(VecDeque::new()));
        let Value::Log(log) = &mut slot.value else {
            return Err(wrong_type(key, &slot.value));
        };
        trim_log(log, now_ms, window_ms);
        if record {
            insert_sorted(log, now_ms);
            slot.expires_at = expiry(now, Duration::from_millis(window_ms));
        }
        Ok(log.len() as u64)
    }

    async fn push_recent(
        &self,
        key: &str,
        value: String,
        max_len: usize,
        ttl: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let (mut state, now) = self.guard();
        let slot = state.live_or_insert(key, now, || Value::List(VecDeque::new()));
        let Value::List(list) = &mut slot.value else {
            return Err(wrong_type(key, &slot.value));
        };
        list.push_back(value);
        while list.len() > max_len {
            list.pop_front();
        }
        let snapshot = list.iter().cloned().collect();
        slot.expires_at = expiry(now, ttl);
        Ok(snapshot)
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let (mut state, now) = self.guard();
        state.slots.insert(key.to_string(), Slot { value: Value::Flag, expires_at: expiry(now, ttl) });
        Ok(())
    }

    async fn flag_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let (mut state, now) = self.guard();
        match state.live(key, now) {
            None => Ok(None),
            Some(Slot { value: Value::Flag, expires_at }) => {
                Ok(expires_at.map(|at| Duration::from_millis(at.saturating_sub(now))))
            }
            Some(slot) => Err(wrong_type(key, &slot.value)),
        }
    }

    async fn stat_get(&self, name: &str) -> Result<Option<FeatureStat>, StoreError> {
        let (mut state, now) = self.guard();
        match state.live(name, now) {
            None => Ok(None),
            Some(Slot { value: Value::Stat(stat), .. }) => Ok(Some(*stat)),
            Some(slot) => Err(wrong_type(name, &slot.value)),
        }
    }

    async fn stat_add(&self, name: &str, value: f64, ttl: Duration) -> Result<(), StoreError> {
        let (mut state, now) = self.guard();
        let slot = state.live_or_insert(name, now, || Value::Stat(FeatureStat::default()));
        let Value::Stat(stat) = &mut slot.value else {
            return Err(wrong_type(name, &slot.value));
        };
        stat.count += 1;
        stat.sum += value;
        stat.sum_of_squares += value * value;
        slot.expires_at = expiry(now, ttl);
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
        let (mut state, now) = self.guard();
        state.queue_push(queue, member, score, not_before_ms, ttl, now)
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
        let (mut state, now) = self.guard();
        let occupancy = state.queue_occupancy(queue, now)?;
        if occupancy >= limit {
            return Ok(BoundedPush::Full { occupancy });
        }
        let position = state.queue_push(queue, member, score, not_before_ms, ttl, now)?;
        Ok(BoundedPush::Queued { position })
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, StoreError> {
        let (mut state, now) = self.guard();
        state.queue_occupancy(queue, now)
    }

    async fn queue_claim(
        &self,
        queue: &str,
        max: usize,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let (mut state, now) = self.guard();
        let q = match state.live(queue, now) {
            None => return Ok(Vec::new()),
            Some(Slot { value: Value::Queue(q), .. }) => q,
            Some(slot) => return Err(wrong_type(queue, &slot.value)),
        };
        let due: Vec<(u64, u64)> = q
            .pending
            .iter()
            .filter(|(_, p)| p.not_before <= now_ms)
            .take(max)
            .map(|(k, _)| *k)
            .collect();
        let mut claimed = Vec::with_capacity(due.len());
        for key in due {
            if let Some(p) = q.pending.remove(&key) {
                q.index.remove(&p.member);
                q.inflight.insert(
                    p.member.clone(),
                    Leased {
                        score: key.0,
                        not_before: p.not_before,
                        lease_until: now_ms.saturating_add(lease_ms),
                    },
                );
                claimed.push(QueueItem { member: p.member, score: key.0 });
            }
        }
        Ok(claimed)
    }

    async fn queue_ack(&self, queue: &str, member: &str) -> Result<bool, StoreError> {
        let (mut state, now) = self.guard();
        match state.live(queue, now) {
            None => Ok(false),
            Some(Slot { value: Value::Queue(q), .. }) => Ok(q.inflight.remove(member).is_some()),
            Some(slot) => Err(wrong_type(queue, &slot.value)),
        }
    }

    async fn queue_members(&self, queue: &str) -> Result<Vec<QueueItem>, StoreError> {
        let (mut state, now) = self.guard();
        match state.live(queue, now) {
            None => Ok(Vec::new()),
            Some(Slot { value: Value::Queue(q), .. }) => Ok(q
                .pending
                .iter()
                .map(|((score, _), p)| QueueItem { member: p.member.clone(), score: *score })
                .collect()),
            Some(slot) => Err(wrong_type(queue, &slot.value)),
        }
    }

    async fn queue_remove(&self, queue: &str, member: &str) -> Result<bool, StoreError> {
        let (mut state, now) = self.guard();
        match state.live(queue, now) {
            None => Ok(false),
            Some(Slot { value: Value::Queue(q), .. }) => match q.index.remove(member) {
                Some(key) => Ok(q.pending.remove(&key).is_some()),
                None => Ok(false),
            },
            Some(slot) => Err(wrong_type(queue, &slot.value)),
        }
    }

    async fn queue_recover_leases(&self, queue: &str, now_ms: u64) -> Result<usize, StoreError> {
        let (mut state, now) = self.guard();
        let q = match state.live(queue, now) {
            None => return Ok(0),
            Some(Slot { value: Value::Queue(q), .. }) => q,
            Some(slot) => return Err(wrong_type(queue, &slot.value)),
        };
        let stale: Vec<String> = q
            .inflight
            .iter()
            .filter(|(_, lease)| lease.lease_until < now_ms)
            .map(|(member, _)| member.clone())
            .collect();
        for member in &stale {
            if let Some(lease) = q.inflight.remove(member) {
                q.insert(member, lease.score, lease.not_before);
            }
        }
        Ok(stale.len())
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let (state, now) = self.guard();
        let mut names: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, s)| s.expires_at.map_or(true, |at| at > now))
            .filter_map(|(k, s)| match &s.value {
                Value::Queue(q) if !q.is_empty() => Some(k.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        Ok(names)
    }
}
