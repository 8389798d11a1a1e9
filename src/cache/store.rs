//! Cache storage port and the in-process implementation.
//!
//! Values are opaque JSON documents so a networked store can sit behind the
//! same trait. The in-process store keeps one LRU per namespace and checks
//! absolute expiry on read.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use super::config::CacheConfig;
use super::keys::{CacheKey, Namespace};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

pub(crate) const METRIC_CACHE_HIT: &str = "vhub_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "vhub_cache_miss_total";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cached value could not be encoded: {0}")]
    Codec(String),
}

impl CacheError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>, CacheError>;

    async fn put(&self, key: &CacheKey, value: Value, ttl: Duration) -> Result<(), CacheError>;

    /// Removes one entry; returns whether it was present.
    async fn evict(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Removes every entry of the namespace; returns how many were removed.
    async fn evict_namespace(&self, namespace: Namespace) -> Result<usize, CacheError>;
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

pub struct MemoryCacheStore {
    namespaces: HashMap<Namespace, RwLock<LruCache<String, Entry>>>,
}

impl MemoryCacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        let namespaces = Namespace::ALL
            .into_iter()
            .map(|namespace| {
                (
                    namespace,
                    RwLock::new(LruCache::new(config.capacity_non_zero())),
                )
            })
            .collect();
        Self { namespaces }
    }

    fn namespace(
        &self,
        namespace: Namespace,
    ) -> Result<&RwLock<LruCache<String, Entry>>, CacheError> {
        self.namespaces.get(&namespace).ok_or_else(|| {
            CacheError::unavailable(format!("namespace `{namespace}` not configured"))
        })
    }

    /// Number of live (unexpired) entries in a namespace.
    pub fn len(&self, namespace: Namespace) -> usize {
        let now = Instant::now();
        match self.namespaces.get(&namespace) {
            Some(lock) => rw_read(lock, SOURCE, "len")
                .iter()
                .filter(|(_, entry)| entry.expires_at > now)
                .count(),
            None => 0,
        }
    }

    pub fn is_empty(&self, namespace: Namespace) -> bool {
        self.len(namespace) == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>, CacheError> {
        let namespace = key.namespace().as_str();
        let mut entries = rw_write(self.namespace(key.namespace())?, SOURCE, "get");

        let now = Instant::now();
        let found = entries
            .get(key.key())
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));
        let hit = match found {
            Some(Some(value)) => Some(value),
            Some(None) => {
                entries.pop(key.key());
                None
            }
            None => None,
        };

        if hit.is_some() {
            counter!(METRIC_CACHE_HIT, "namespace" => namespace).increment(1);
        } else {
            counter!(METRIC_CACHE_MISS, "namespace" => namespace).increment(1);
        }
        Ok(hit)
    }

    async fn put(&self, key: &CacheKey, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        rw_write(self.namespace(key.namespace())?, SOURCE, "put")
            .put(key.key().to_string(), entry);
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let removed = rw_write(self.namespace(key.namespace())?, SOURCE, "evict")
            .pop(key.key())
            .is_some();
        Ok(removed)
    }

    async fn evict_namespace(&self, namespace: Namespace) -> Result<usize, CacheError> {
        let mut entries = rw_write(self.namespace(namespace)?, SOURCE, "evict_namespace");
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }
}
