//! Shared fixtures for unit tests.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::{
    AtomicStore, BoundedPush, FeatureStat, QueueItem, SlidingWindowOutcome, TokenBucketOutcome,
};

/// Store whose every operation reports an outage.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingStore;

fn down<T>() -> Result<T, StoreError> {
    Err(StoreError::Unavailable("connection refused".into()))
}

#[async_trait]
impl AtomicStore for FailingStore {
    async fn token_bucket(
        &self,
        _: &str,
        _: f64,
        _: f64,
        _: u64,
        _: Duration,
    ) -> Result<TokenBucketOutcome, StoreError> {
        down()
    }
    async fn peek_token_bucket(&self, _: &str, _: f64, _: u64) -> Result<f64, StoreError> {
        down()
    }
    async fn sliding_window(
        &self,
        _: &str,
        _: u64,
        _: u64,
        _: u64,
        _: u64,
        _: u64,
    ) -> Result<SlidingWindowOutcome, StoreError> {
        down()
    }
    async fn incr(&self, _: &str, _: Duration) -> Result<u64, StoreError> {
        down()
    }
    async fn count_events(&self, _: &str, _: u64, _: u64, _: bool) -> Result<u64, StoreError> {
        down()
    }
    async fn push_recent(
        &self,
        _: &str,
        _: String,
        _: usize,
        _: Duration,
    ) -> Result<Vec<String>, StoreError> {
        down()
    }
    async fn set_flag(&self, _: &str, _: Duration) -> Result<(), StoreError> {
        down()
    }
    async fn flag_ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
        down()
    }
    async fn stat_get(&self, _: &str) -> Result<Option<FeatureStat>, StoreError> {
        down()
    }
    async fn stat_add(&self, _: &str, _: f64, _: Duration) -> Result<(), StoreError> {
        down()
    }
    async fn queue_push(
        &self,
        _: &str,
        _: &str,
        _: u64,
        _: u64,
        _: Duration,
    ) -> Result<usize, StoreError> {
        down()
    }
    async fn queue_push_bounded(
        &self,
        _: &str,
        _: &str,
        _: u64,
        _: u64,
        _: Duration,
        _: usize,
    ) -> Result<BoundedPush, StoreError> {
        down()
    }
    async fn queue_len(&self, _: &str) -> Result<usize, StoreError> {
        down()
    }
    async fn queue_claim(
        &self,
        _: &str,
        _: usize,
        _: u64,
        _: u64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        down()
    }
    async fn queue_ack(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        down()
    }
    async fn queue_members(&self, _: &str) -> Result<Vec<QueueItem>, StoreError> {
        down()
    }
    async fn queue_remove(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        down()
    }
    async fn queue_recover_leases(&self, _: &str, _: u64) -> Result<usize, StoreError> {
        down()
    }
    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        down()
    }
}
