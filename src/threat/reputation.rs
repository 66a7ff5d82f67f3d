//! IP reputation lookups behind a TTL cache.

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::cache::{CacheConfig, ReadThroughCache};
use crate::clock::Clock;
use crate::error::ReputationError;

/// External reputation feed. Scores run 0 (clean) to 100 (known bad).
#[async_trait]
pub trait ReputationSource: Send + Sync + Debug {
    /// Score for `ip`, `None` when the feed has no opinion.
    async fn lookup(&self, ip: IpAddr) -> Result<Option<u8>, ReputationError>;
}

/// Fixed score table, for tests and static deny lists.
#[derive(Debug, Default, Clone)]
pub struct StaticReputation {
    scores: Arc<RwLock<HashMap<IpAddr, u8>>>,
}

impl StaticReputation {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the score for `ip`.
    pub fn insert(&self, ip: IpAddr, score: u8) {
        self.scores.write().unwrap_or_else(|e| e.into_inner()).insert(ip, score.min(100));
    }
}

#[async_trait]
impl ReputationSource for StaticReputation {
    async fn lookup(&self, ip: IpAddr) -> Result<Option<u8>, ReputationError> {
        Ok(self.scores.read().unwrap_or_else(|e| e.into_inner()).get(&ip).copied())
    }
}

/// Addresses that never leave the local network and are not worth looking up.
pub fn is_internal(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xffc0) == 0xfe80
                || (first & 0xfe00) == 0xfc00
                || v6.to_ipv4_mapped().is_some_and(|v4| is_internal(&IpAddr::V4(v4)))
        }
    }
}

/// Cached reputation client. Lookup failures are logged and read as "no opinion".
#[derive(Debug)]
pub struct ReputationLookup {
    source: Arc<dyn ReputationSource>,
    cache: ReadThroughCache<IpAddr, Option<u8>>,
}

impl ReputationLookup {
    /// Wrap `source` with a cache of lifetime `ttl`.
    pub fn new(source: Arc<dyn ReputationSource>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { source, cache: ReadThroughCache::new(CacheConfig::with_ttl(ttl), clock) }
    }

    /// Reputation score for `ip`; internal addresses bypass the source.
    pub async fn score(&self, ip: IpAddr) -> Option<u8> {
        if is_internal(&ip) {
            return None;
        }
        let source = &self.source;
        match self.cache.get_or_load(&ip, || async { source.lookup(ip).await }).await {
            Ok(score) => score,
            Err(err) => {
                warn!(target: "tollgate::threat", %ip, error = %err, "reputation lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReputationSource for Counting {
        async fn lookup(&self, _ip: IpAddr) -> Result<Option<u8>, ReputationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ReputationError("feed offline".into()))
            } else {
                Ok(Some(95))
            }
        }
    }

    #[test]
    fn internal_ranges() {
        for ip in ["10.1.2.3", "192.168.0.1", "127.0.0.1", "169.254.1.1", "0.0.0.0", "::1", "fe80::1", "fd00::1"] {
            assert!(is_internal(&ip.parse().unwrap()), "{ip}");
        }
        for ip in ["8.8.8.8", "2001:4860::8888"] {
            assert!(!is_internal(&ip.parse().unwrap()), "{ip}");
        }
    }

    #[tokio::test]
    async fn internal_addresses_bypass_source() {
        let source = Arc::new(Counting::default());
        let lookup = ReputationLookup::new(source.clone(), Duration::from_secs(60), Arc::new(ManualClock::new(0)));
        assert_eq!(lookup.score("10.0.0.1".parse().unwrap()).await, None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn results_are_cached() {
        let source = Arc::new(Counting::default());
        let lookup = ReputationLookup::new(source.clone(), Duration::from_secs(60), Arc::new(ManualClock::new(0)));
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(lookup.score(ip).await, Some(95));
        assert_eq!(lookup.score(ip).await, Some(95));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_read_as_no_opinion() {
        let source = Arc::new(Counting { fail: true, ..Default::default() });
        let lookup = ReputationLookup::new(source.clone(), Duration::from_secs(60), Arc::new(ManualClock::new(0)));
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(lookup.score(ip).await, None);
        assert_eq!(lookup.score(ip).await, None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
