//! Side-channel storage for failed job payloads.
//!
//! Backends quarantine every failed job under `job:failed:<id>` so that an
//! operator can inspect what went wrong without digging through the queue.
//! Anything that can `set` a string under a key will do.

use crate::error::CourierResult;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Key-value sink used for dead-letter records.
#[async_trait]
pub trait FailedJobCache: Send + Sync + std::fmt::Debug {
    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String) -> CourierResult<()>;

    /// Read a value back. Used by tooling and tests.
    async fn get(&self, key: &str) -> CourierResult<Option<String>>;
}

/// Process-local cache, useful for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// All keys currently stored, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl FailedJobCache for InMemoryCache {
    async fn set(&self, key: &str, value: String) -> CourierResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> CourierResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }
}

#[cfg(feature = "redis-cache")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-cache")))]
pub use redis_cache::RedisCache;

#[cfg(feature = "redis-cache")]
mod redis_cache {
    use super::FailedJobCache;
    use crate::config::RedisCacheConfig;
    use crate::error::{CourierError, CourierResult};
    use async_trait::async_trait;
    use redis::{AsyncCommands, Client, aio::ConnectionManager};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Redis-backed cache. Entries expire after `ttl_secs` when set.
    pub struct RedisCache {
        conn: ConnectionManager,
        config: RedisCacheConfig,
    }

    impl std::fmt::Debug for RedisCache {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisCache")
                .field("config", &self.config)
                .finish_non_exhaustive()
        }
    }

    impl RedisCache {
        /// Connect to Redis.
        pub async fn new(config: RedisCacheConfig) -> CourierResult<Self> {
            let client = Client::open(config.url.as_str()).map_err(|e| {
                CourierError::config(format!("invalid Redis url '{}': {}", config.url, e))
            })?;

            let conn = timeout(Duration::from_secs(10), client.get_connection_manager())
                .await
                .map_err(|e| CourierError::queue("Timed out connecting to Redis", e))??;

            tracing::info!("Connected to Redis failed-job cache at {}", config.url);
            Ok(Self { conn, config })
        }

        fn key(&self, key: &str) -> String {
            if self.config.prefix.is_empty() {
                key.to_string()
            } else {
                format!("{}:{}", self.config.prefix, key)
            }
        }
    }

    #[async_trait]
    impl FailedJobCache for RedisCache {
        async fn set(&self, key: &str, value: String) -> CourierResult<()> {
            let mut conn = self.conn.clone();
            let key = self.key(key);
            match self.config.ttl_secs {
                Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await?,
                None => conn.set::<_, _, ()>(key, value).await?,
            }
            Ok(())
        }

        async fn get(&self, key: &str) -> CourierResult<Option<String>> {
            let mut conn = self.conn.clone();
            Ok(conn.get(self.key(key)).await?)
        }
    }
}
