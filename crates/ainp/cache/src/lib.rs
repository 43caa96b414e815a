//! Cache and rate-limit adapter.
//!
//! One trait, two backends: redis for deployments, in-memory for tests and
//! development. Sliding windows are sorted sets of millisecond timestamps:
//! trim, count, then insert. Rate-limit callers are expected to fail open
//! when this layer reports the backend unreachable.

#![deny(unsafe_code)]

mod memory;
mod redis_backend;

pub use memory::InMemoryCache;
pub use redis_backend::RedisCache;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// TTL applied to cached embeddings (60 days).
pub const EMBEDDING_CACHE_TTL: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Outcome of a sliding-window rate check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// When the window frees a slot: oldest retained timestamp + window.
    pub reset_at_ms: i64,
}

/// Cache-layer errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unreachable: {0}")]
    Unavailable(String),

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization error: {0}")]
    Serialization(String),
}

/// The broker's cache surface.
#[async_trait]
pub trait BrokerCache: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Set only if the key is absent. Returns true when the value was
    /// written; false when the key already existed. This is the atomic
    /// primitive behind replay rejection and one-shot bypass tokens.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn incr(&self, key: &str) -> CacheResult<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()>;

    /// Sliding-window check: trim entries older than the window, count,
    /// insert the new timestamp only when under the limit.
    async fn sliding_window_allow(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> CacheResult<RateDecision>;

    async fn cache_embedding(&self, text_hash: &str, vector: &[f32]) -> CacheResult<()>;

    async fn lookup_embedding(&self, text_hash: &str) -> CacheResult<Option<Vec<f32>>>;

    /// Liveness probe for the readiness endpoint.
    async fn ping(&self) -> CacheResult<()>;
}
