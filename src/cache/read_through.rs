//! Read-through access to the cache store.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::config::CacheConfig;
use super::keys::CacheKey;
use super::store::CacheStore;

#[derive(Clone)]
pub struct ReadThroughCache {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
}

impl ReadThroughCache {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    /// Returns the cached value for `key`, or runs `compute` and stores its
    /// result with the namespace TTL.
    ///
    /// Cache failures never fail the read: an unreadable entry is treated as
    /// a miss and a failed population is only logged.
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: &CacheKey, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return compute().await;
        }

        match self.store.get(key).await {
            Ok(Some(value)) => match serde_json::from_value::<T>(value) {
                Ok(hit) => return Ok(hit),
                Err(err) => {
                    warn!(
                        target = "vhub::cache::read_through",
                        key = %key,
                        error = %err,
                        "Discarding undecodable cache entry"
                    );
                    if let Err(err) = self.store.evict(key).await {
                        warn!(
                            target = "vhub::cache::read_through",
                            key = %key,
                            error = %err,
                            "Cache eviction failed"
                        );
                    }
                }
            },
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target = "vhub::cache::read_through",
                    key = %key,
                    error = %err,
                    "Cache lookup failed; reading through"
                );
            }
        }

        let computed = compute().await?;
        self.populate(key, &computed).await;
        Ok(computed)
    }

    async fn populate<T: Serialize>(&self, key: &CacheKey, value: &T) {
        let encoded = match serde_json::to_value(value) {
            Ok(serde_json::Value::Null) => return,
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(
                    target = "vhub::cache::read_through",
                    key = %key,
                    error = %err,
                    "Computed value is not cacheable"
                );
                return;
            }
        };

        let ttl = self.config.ttl_for(key.namespace());
        if let Err(err) = self.store.put(key, encoded, ttl).await {
            warn!(
                target = "vhub::cache::read_through",
                key = %key,
                error = %err,
                "Cache population failed"
            );
        }
    }
}
