//! Cache eviction on the write paths.
//!
//! Eviction is best-effort: a failed eviction is logged and counted, never
//! surfaced to the caller. A lost eviction leaves an entry stale for at most
//! its namespace TTL.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, warn};

use super::events::Mutation;
use super::keys::{CacheKey, Namespace};
use super::planner::EvictionPlan;
use super::store::CacheStore;
use crate::domain::entities::PostRecord;
use crate::domain::identity::VolunteerIdentity;

const METRIC_CACHE_EVICT: &str = "vhub_cache_evict_total";
const METRIC_CACHE_EVICT_FAILED: &str = "vhub_cache_evict_failed_total";
const METRIC_CACHE_EVICT_MS: &str = "vhub_cache_evict_ms";

#[derive(Clone)]
pub struct CacheEvictor {
    store: Arc<dyn CacheStore>,
    enabled: bool,
}

impl CacheEvictor {
    pub fn new(store: Arc<dyn CacheStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Removes a single entry.
    pub async fn evict(&self, namespace: Namespace, key: impl Into<String>) {
        self.evict_key(&CacheKey::new(namespace, key)).await;
    }

    pub async fn evict_key(&self, key: &CacheKey) {
        if !self.enabled {
            return;
        }

        match self.store.evict(key).await {
            Ok(removed) => {
                counter!(METRIC_CACHE_EVICT, "namespace" => key.namespace().as_str()).increment(1);
                debug!(
                    target = "vhub::cache::evictor",
                    key = %key,
                    removed,
                    "Cache entry evicted"
                );
            }
            Err(err) => {
                counter!(METRIC_CACHE_EVICT_FAILED, "namespace" => key.namespace().as_str())
                    .increment(1);
                warn!(
                    target = "vhub::cache::evictor",
                    key = %key,
                    error = %err,
                    "Cache eviction failed"
                );
            }
        }
    }

    /// Removes every entry of a namespace.
    pub async fn evict_all(&self, namespace: Namespace) {
        if !self.enabled {
            return;
        }

        match self.store.evict_namespace(namespace).await {
            Ok(removed) => {
                counter!(METRIC_CACHE_EVICT, "namespace" => namespace.as_str()).increment(1);
                debug!(
                    target = "vhub::cache::evictor",
                    namespace = namespace.as_str(),
                    removed,
                    "Cache namespace evicted"
                );
            }
            Err(err) => {
                counter!(METRIC_CACHE_EVICT_FAILED, "namespace" => namespace.as_str())
                    .increment(1);
                warn!(
                    target = "vhub::cache::evictor",
                    namespace = namespace.as_str(),
                    error = %err,
                    "Cache namespace eviction failed"
                );
            }
        }
    }

    /// Evicts everything the mutation makes stale.
    pub async fn apply(&self, mutation: &Mutation) {
        if !self.enabled {
            return;
        }

        let started_at = Instant::now();
        let plan = EvictionPlan::for_mutation(mutation);
        for key in &plan.keys {
            self.evict_key(key).await;
        }
        for namespace in &plan.namespaces {
            self.evict_all(*namespace).await;
        }

        debug!(
            target = "vhub::cache::evictor",
            mutation = mutation.label(),
            plan = %plan,
            "Eviction plan applied"
        );
        histogram!(METRIC_CACHE_EVICT_MS, "mutation" => mutation.label())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
    }

    pub async fn request_created(&self, volunteer: &VolunteerIdentity, post_id: i64) {
        self.apply(&Mutation::RequestCreated {
            volunteer: volunteer.clone(),
            post_id,
        })
        .await;
    }

    pub async fn request_deleted(
        &self,
        volunteer: &VolunteerIdentity,
        post_id: i64,
        org_email: Option<&str>,
        slots_changed: bool,
    ) {
        self.apply(&Mutation::RequestDeleted {
            volunteer: volunteer.clone(),
            post_id,
            org_email: org_email.map(str::to_string),
            slots_changed,
        })
        .await;
    }

    pub async fn request_reviewed(
        &self,
        volunteer: &VolunteerIdentity,
        post: &PostRecord,
        slots_changed: bool,
    ) {
        self.apply(&Mutation::RequestReviewed {
            volunteer: volunteer.clone(),
            post_id: post.id,
            org_email: post.org_email.clone(),
            slots_changed,
        })
        .await;
    }
}
