//! In-memory cache backend: deterministic, test-friendly, no eviction
//! pressure. Mirrors the redis backend's observable semantics including
//! lazy TTL expiry and trim-count-insert sliding windows.

use crate::{BrokerCache, CacheError, CacheResult, RateDecision};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at_ms: i64,
}

/// In-memory cache adapter.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    counters: Mutex<HashMap<String, (i64, i64)>>,
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
    embeddings: Mutex<HashMap<String, Vec<f32>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> CacheResult<std::sync::MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|_| CacheError::Backend(format!("{what} lock poisoned")))
    }
}

#[async_trait]
impl BrokerCache for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut entries = Self::lock(&self.entries, "entries")?;
        match entries.get(key) {
            Some(entry) if entry.expires_at_ms > Self::now_ms() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut entries = Self::lock(&self.entries, "entries")?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms: Self::now_ms() + ttl.as_millis() as i64,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut entries = Self::lock(&self.entries, "entries")?;
        let now = Self::now_ms();
        if let Some(existing) = entries.get(key) {
            if existing.expires_at_ms > now {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms: now + ttl.as_millis() as i64,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        Self::lock(&self.entries, "entries")?.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        let mut counters = Self::lock(&self.counters, "counters")?;
        let now = Self::now_ms();
        let slot = counters.entry(key.to_string()).or_insert((0, i64::MAX));
        if slot.1 <= now {
            *slot = (0, i64::MAX);
        }
        slot.0 += 1;
        Ok(slot.0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let deadline = Self::now_ms() + ttl.as_millis() as i64;
        if let Some(entry) = Self::lock(&self.entries, "entries")?.get_mut(key) {
            entry.expires_at_ms = deadline;
        }
        if let Some(counter) = Self::lock(&self.counters, "counters")?.get_mut(key) {
            counter.1 = deadline;
        }
        Ok(())
    }

    async fn sliding_window_allow(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> CacheResult<RateDecision> {
        let mut windows = Self::lock(&self.windows, "windows")?;
        let now = Self::now_ms();
        let window_ms = window.as_millis() as i64;
        let slots = windows.entry(key.to_string()).or_default();

        while let Some(front) = slots.front() {
            if *front < now - window_ms {
                slots.pop_front();
            } else {
                break;
            }
        }

        let count = slots.len() as u32;
        if count < limit {
            slots.push_back(now);
            Ok(RateDecision {
                allowed: true,
                remaining: limit - count - 1,
                reset_at_ms: slots.front().copied().unwrap_or(now) + window_ms,
            })
        } else {
            Ok(RateDecision {
                allowed: false,
                remaining: 0,
                reset_at_ms: slots.front().copied().unwrap_or(now) + window_ms,
            })
        }
    }

    async fn cache_embedding(&self, text_hash: &str, vector: &[f32]) -> CacheResult<()> {
        Self::lock(&self.embeddings, "embeddings")?
            .insert(text_hash.to_string(), vector.to_vec());
        Ok(())
    }

    async fn lookup_embedding(&self, text_hash: &str) -> CacheResult<Option<Vec<f32>>> {
        Ok(Self::lock(&self.embeddings, "embeddings")?.get(text_hash).cloned())
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let cache = InMemoryCache::new();
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let cache = InMemoryCache::new();
        cache.set("k", "v", Duration::from_millis(0)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_refuses_live_keys() {
        let cache = InMemoryCache::new();
        assert!(cache.set_nx("k", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!cache.set_nx("k", "b", Duration::from_secs(60)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn incr_is_monotonic() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.incr("c").await.unwrap(), 1);
        assert_eq!(cache.incr("c").await.unwrap(), 2);
        assert_eq!(cache.incr("c").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn window_denies_at_limit_with_reset_hint() {
        let cache = InMemoryCache::new();
        let window = Duration::from_secs(60);

        let mut first_allowed_at = None;
        for _ in 0..3 {
            let d = cache.sliding_window_allow("w", 3, window).await.unwrap();
            assert!(d.allowed);
            if first_allowed_at.is_none() {
                first_allowed_at = Some(d.reset_at_ms - 60_000);
            }
        }

        let denied = cache.sliding_window_allow("w", 3, window).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        // Reset is anchored to the oldest retained timestamp.
        assert_eq!(denied.reset_at_ms, first_allowed_at.unwrap() + 60_000);
    }

    #[tokio::test]
    async fn window_remaining_counts_down() {
        let cache = InMemoryCache::new();
        let window = Duration::from_secs(60);
        let d1 = cache.sliding_window_allow("w", 3, window).await.unwrap();
        let d2 = cache.sliding_window_allow("w", 3, window).await.unwrap();
        assert_eq!(d1.remaining, 2);
        assert_eq!(d2.remaining, 1);
    }

    #[tokio::test]
    async fn embedding_cache_round_trip() {
        let cache = InMemoryCache::new();
        let vector = vec![0.25f32, -0.5, 1.0];
        cache.cache_embedding("hash", &vector).await.unwrap();
        assert_eq!(cache.lookup_embedding("hash").await.unwrap(), Some(vector));
        assert_eq!(cache.lookup_embedding("other").await.unwrap(), None);
    }
}
