//! Fast volatile cache in front of the idempotency table.
//!
//! The cache is an optimization only. Every caller must treat a [`CacheError`]
//! as a miss; correctness rests on the `idempotency_records` table.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use thiserror::Error;
use tracing::debug;

/// Failures from the cache backend. Never surfaced to command callers.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache call timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Key/value cache with per-entry TTL.
#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
}

/// Cache key for an idempotency key.
pub fn idempotency_cache_key(idempotency_key: &str) -> String {
    format!("idempotency:{}", idempotency_key)
}

#[derive(Clone)]
struct CachedValue {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache backed by moka.
#[derive(Clone)]
pub struct MokaCache {
    cache: Cache<String, CachedValue>,
}

impl MokaCache {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();

        Self { cache }
    }
}

#[async_trait]
impl IdempotencyCache for MokaCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let hit = self.cache.get(key).await.map(|entry| entry.value);
        if hit.is_some() {
            debug!(key = %key, "cache hit");
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.cache
            .insert(key.to_string(), CachedValue { value, ttl })
            .await;
        Ok(())
    }
}

/// Cache that stores nothing. Every lookup is a miss.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl IdempotencyCache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }
}
