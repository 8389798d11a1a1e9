//! Cache configuration: enablement, capacity and per-namespace TTLs.

use std::num::NonZeroUsize;
use std::time::Duration;

use super::keys::Namespace;

const DEFAULT_CAPACITY_PER_NAMESPACE: usize = 1_024;
const DEFAULT_POST_BY_ID_TTL: Duration = Duration::from_secs(300);
const DEFAULT_POSTS_OF_ORG_TTL: Duration = Duration::from_secs(45);
const DEFAULT_REQUESTS_OF_VOLUNTEER_TTL: Duration = Duration::from_secs(45);
const DEFAULT_POSTS_TTL: Duration = Duration::from_secs(60);
const DEFAULT_HOME_TOP_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// When disabled, reads always compute and evictions are no-ops.
    pub enabled: bool,
    /// Maximum live entries per namespace before LRU eviction.
    pub capacity_per_namespace: usize,
    pub post_by_id_ttl: Duration,
    pub posts_of_org_ttl: Duration,
    pub requests_of_volunteer_ttl: Duration,
    pub posts_ttl: Duration,
    pub home_top_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_per_namespace: DEFAULT_CAPACITY_PER_NAMESPACE,
            post_by_id_ttl: DEFAULT_POST_BY_ID_TTL,
            posts_of_org_ttl: DEFAULT_POSTS_OF_ORG_TTL,
            requests_of_volunteer_ttl: DEFAULT_REQUESTS_OF_VOLUNTEER_TTL,
            posts_ttl: DEFAULT_POSTS_TTL,
            home_top_ttl: DEFAULT_HOME_TOP_TTL,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            capacity_per_namespace: settings.capacity_per_namespace.get(),
            post_by_id_ttl: settings.post_by_id_ttl,
            posts_of_org_ttl: settings.posts_of_org_ttl,
            requests_of_volunteer_ttl: settings.requests_of_volunteer_ttl,
            posts_ttl: settings.posts_ttl,
            home_top_ttl: settings.home_top_ttl,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, namespace: Namespace) -> Duration {
        match namespace {
            Namespace::PostById => self.post_by_id_ttl,
            Namespace::PostsOfOrg => self.posts_of_org_ttl,
            Namespace::RequestsOfVolunteer => self.requests_of_volunteer_ttl,
            Namespace::Posts => self.posts_ttl,
            Namespace::HomeTop => self.home_top_ttl,
        }
    }

    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity_per_namespace).unwrap_or(NonZeroUsize::MIN)
    }
}
