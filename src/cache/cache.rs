//! Generic cache trait and Redis implementation
//!
//! Values are stored as JSON with an optional TTL. Connection failures degrade
//! to cache misses so Redis being down never blocks a payment.

use super::{error::CacheResult, RedisPool};
use crate::cache::CacheError;
use async_trait::async_trait;
use bb8::PooledConnection;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

type RedisConnection<'a> = PooledConnection<'a, RedisConnectionManager>;

/// Generic cache trait supporting any serializable type
#[async_trait]
pub trait Cache<T: Serialize + DeserializeOwned + Send + Sync + 'static> {
    /// Get a value from cache by key
    async fn get(&self, key: &str) -> CacheResult<Option<T>>;

    /// Set a value in cache with optional TTL
    async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete a value from cache
    async fn delete(&self, key: &str) -> CacheResult<bool>;
}

/// Redis implementation of the Cache trait
#[derive(Clone)]
pub struct RedisCache {
    pool: RedisPool,
}

impl RedisCache {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    async fn get_connection(&self) -> CacheResult<RedisConnection<'_>> {
        self.pool.get().await.map_err(|e| {
            warn!("Failed to get Redis connection: {}", e);
            e.into()
        })
    }
}

#[async_trait]
impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Cache<T> for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<T>> {
        let mut conn = match self.get_connection().await {
            Ok(conn) => conn,
            Err(_) => return Ok(None), // Graceful degradation
        };

        let result: Option<String> = conn.get(key).await.map_err(|e| {
            warn!("Redis GET failed for key '{}': {}", key, e);
            e
        })?;

        match result {
            Some(json_str) => match serde_json::from_str(&json_str) {
                Ok(value) => {
                    debug!("Cache hit for key: {}", key);
                    Ok(Some(value))
                }
                Err(e) => {
                    warn!("Failed to deserialize cache value for key '{}': {}", key, e);
                    Ok(None)
                }
            },
            None => {
                debug!("Cache miss for key: {}", key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = match self.get_connection().await {
            Ok(conn) => conn,
            Err(_) => return Ok(()), // Graceful degradation - don't fail
        };

        let json_str = serde_json::to_string(value).map_err(|e| {
            warn!("Failed to serialize value for key '{}': {}", key, e);
            e
        })?;

        match ttl {
            Some(ttl_duration) => {
                let ttl_seconds = ttl_duration.as_secs();
                if ttl_seconds == 0 {
                    return Err(CacheError::TtlError(format!(
                        "TTL for key '{}' rounds down to zero seconds",
                        key
                    )));
                }
                let _: () = conn.set_ex(key, json_str, ttl_seconds).await.map_err(|e| {
                    warn!("Redis SET_EX failed for key '{}': {}", key, e);
                    e
                })?;
            }
            None => {
                let _: () = conn.set(key, json_str).await.map_err(|e| {
                    warn!("Redis SET failed for key '{}': {}", key, e);
                    e
                })?;
            }
        }

        debug!("Cache set for key: {} (ttl: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = match self.get_connection().await {
            Ok(conn) => conn,
            Err(_) => return Ok(false), // Graceful degradation
        };

        let result: i32 = conn.del(key).await.map_err(|e| {
            warn!("Redis DEL failed for key '{}': {}", key, e);
            e
        })?;

        Ok(result > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestData {
        id: u32,
        name: String,
    }

    // Run with: REDIS_URL=redis://localhost:6379 cargo test --features cache -- --ignored

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_basic_cache_operations() {
        let pool = super::super::init_cache_pool(super::super::CacheConfig::default())
            .await
            .unwrap();
        let cache = RedisCache::new(pool);

        let test_data = TestData {
            id: 1,
            name: "test".to_string(),
        };

        cache
            .set("test:key", &test_data, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let retrieved = cache.get("test:key").await.unwrap();
        assert_eq!(retrieved, Some(test_data));

        assert!(<RedisCache as Cache<TestData>>::delete(&cache, "test:key")
            .await
            .unwrap());
        let gone: Option<TestData> = cache.get("test:key").await.unwrap();
        assert_eq!(gone, None);
    }
}
