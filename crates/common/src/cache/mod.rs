//! Redis cache integration
//!
//! Provides:
//! - A multiplexed Redis connection
//! - Generic JSON get/set operations with TTL
//! - Read-through loading for values fetched from remote services

use crate::config::RedisConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Redis cache client
pub struct Cache {
    connection: RwLock<MultiplexedConnection>,
    key_prefix: String,
}

impl Cache {
    /// Connect using the `redis` config section.
    ///
    /// Returns `Ok(None)` when no URL is configured.
    pub async fn connect(config: &RedisConfig) -> Result<Option<Self>> {
        let Some(url) = config.url.as_deref() else {
            return Ok(None);
        };

        let client = Client::open(url).map_err(|e| AppError::CacheError {
            message: format!("Failed to create Redis client: {}", e),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Some(Self {
            connection: RwLock::new(connection),
            key_prefix: config.key_prefix.clone(),
        }))
    }

    /// Build a prefixed key
    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Get a value from cache
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full_key = self.key(key);
        let mut conn = self.connection.write().await;

        let value: Option<String> = conn.get(&full_key).await?;

        match value {
            Some(json) => {
                let parsed = serde_json::from_str(&json).map_err(|e| AppError::CacheError {
                    message: format!("Failed to parse cached value: {}", e),
                })?;
                debug!(key = %full_key, "Cache hit");
                Ok(Some(parsed))
            }
            None => {
                debug!(key = %full_key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Set a value in cache with custom TTL
    pub async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()> {
        let full_key = self.key(key);
        let json = serde_json::to_string(value)?;

        let mut conn = self.connection.write().await;
        let _: () = conn.set_ex(&full_key, &json, ttl_secs).await?;

        debug!(key = %full_key, ttl_secs, "Cache set");
        Ok(())
    }

    /// Get or set with a loader function.
    ///
    /// Cache failures degrade to calling the loader; loader failures
    /// propagate.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, ttl_secs: u64, cache_name: &str, loader: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match self.get::<T>(key).await {
            Ok(Some(cached)) => {
                metrics::record_cache(true, cache_name);
                return Ok(cached);
            }
            Ok(None) => metrics::record_cache(false, cache_name),
            Err(e) => warn!(error = %e, "Cache read failed, loading from source"),
        }

        let value = loader().await?;

        if let Err(e) = self.set_with_ttl(key, &value, ttl_secs).await {
            warn!(error = %e, "Failed to cache value, continuing without cache");
        }

        Ok(value)
    }

    /// Ping Redis to check connectivity
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.write().await;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(())
    }
}

/// Cache key builder helpers
pub mod keys {
    use crate::session::SessionKind;

    /// Per-minute rate for one provider and medium
    pub fn rate(provider_id: &str, kind: SessionKind) -> String {
        format!("rate:{}:{}", provider_id, kind.as_str())
    }
}
