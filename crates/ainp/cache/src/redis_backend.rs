//! Redis cache backend over a deadpool connection pool.
//!
//! Sliding windows are sorted sets keyed per agent or IP with millisecond
//! scores; members get a uuid suffix so same-millisecond requests stay
//! distinct. TTLs ride on every write so abandoned keys age out.

use crate::{BrokerCache, CacheError, CacheResult, RateDecision};
use async_trait::async_trait;
use deadpool_redis::redis;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::time::Duration;

/// Redis-backed cache adapter.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    /// Build a pool from a `redis://` URL.
    pub fn connect(url: &str) -> CacheResult<Self> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> CacheResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl BrokerCache for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        let mut conn = self.conn().await?;
        redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs() as i64)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn sliding_window_allow(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> CacheResult<RateDecision> {
        let mut conn = self.conn().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_ms = window.as_millis() as i64;
        let floor = now_ms - window_ms;

        redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(floor)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let count: u32 = redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        if count < limit {
            let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
            redis::cmd("ZADD")
                .arg(key)
                .arg(now_ms)
                .arg(member)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(window.as_secs() as i64)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;

            let oldest = oldest_score(&mut conn, key).await?.unwrap_or(now_ms);
            return Ok(RateDecision {
                allowed: true,
                remaining: limit - count - 1,
                reset_at_ms: oldest + window_ms,
            });
        }

        let oldest = oldest_score(&mut conn, key).await?.unwrap_or(now_ms);
        Ok(RateDecision {
            allowed: false,
            remaining: 0,
            reset_at_ms: oldest + window_ms,
        })
    }

    async fn cache_embedding(&self, text_hash: &str, vector: &[f32]) -> CacheResult<()> {
        let encoded = serde_json::to_string(vector)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(
            &format!("emb:{text_hash}"),
            &encoded,
            crate::EMBEDDING_CACHE_TTL,
        )
        .await
    }

    async fn lookup_embedding(&self, text_hash: &str) -> CacheResult<Option<Vec<f32>>> {
        match self.get(&format!("emb:{text_hash}")).await? {
            Some(encoded) => serde_json::from_str(&encoded)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

async fn oldest_score(conn: &mut Connection, key: &str) -> CacheResult<Option<i64>> {
    let entries: Vec<(String, i64)> = redis::cmd("ZRANGE")
        .arg(key)
        .arg(0)
        .arg(0)
        .arg("WITHSCORES")
        .query_async(conn)
        .await
        .map_err(|e| CacheError::Backend(e.to_string()))?;
    Ok(entries.first().map(|(_, score)| *score))
}
