//! Read-through cache with a fixed entry TTL.
//!
//! Used in front of slow collaborators (tenant directory, reputation source). Misses call the
//! loader and store whatever it returns, including `None`, so unknown keys are not re-fetched on
//! every request. Loader errors are never cached.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::Clock;

/// Configuration for a [`ReadThroughCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Lifetime of an entry from the moment it was loaded.
    pub entry_ttl: Duration,
    /// Entries kept before expired ones are purged and, failing that, the oldest evicted.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { entry_ttl: Duration::from_secs(60), max_entries: 10_000 }
    }
}

impl CacheConfig {
    /// Config with the given TTL and default capacity.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { entry_ttl: ttl, ..Self::default() }
    }
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    loaded_at: u64,
}

/// TTL cache that loads missing keys on demand.
#[derive(Debug)]
pub struct ReadThroughCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl<K, V> ReadThroughCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty cache.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), config, clock }
    }

    /// Cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the cached value for `key`, or run `load` and cache its result.
    ///
    /// The lock is not held across `load`; concurrent misses for the same key may each call it.
    pub async fn get_or_load<F, Fut, E>(&self, key: &K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let value = load().await?;
        self.insert(key.clone(), value.clone());
        Ok(value)
    }

    /// Fresh cached value, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_millis();
        let ttl = self.ttl_millis();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if now.saturating_sub(entry.loaded_at) < ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` under `key`.
    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now_millis();
        let ttl = self.ttl_millis();
        let max = self.config.max_entries.max(1);
        let mut entries = self.lock();
        if entries.len() >= max && !entries.contains_key(&key) {
            entries.retain(|_, e| now.saturating_sub(e.loaded_at) < ttl);
            if entries.len() >= max {
                let oldest =
                    entries.iter().min_by_key(|(_, e)| e.loaded_at).map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key, Entry { value, loaded_at: now });
    }

    /// Drop `key` so the next read reloads it.
    pub fn invalidate(&self, key: &K) {
        self.lock().remove(key);
    }

    /// Number of entries held, fresh or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ttl_millis(&self) -> u64 {
        u64::try_from(self.config.entry_ttl.as_millis()).unwrap_or(u64::MAX)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
