//! Cached read paths over the entity store.

use std::sync::Arc;

use super::repos::{RepoError, SignupStore};
use crate::cache::{CacheKey, ReadThroughCache};
use crate::domain::entities::{PostRecord, RequestSummary};
use crate::domain::identity::VolunteerIdentity;

#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn SignupStore>,
    cache: ReadThroughCache,
}

impl QueryService {
    pub fn new(store: Arc<dyn SignupStore>, cache: ReadThroughCache) -> Self {
        Self { store, cache }
    }

    pub async fn requests_of_volunteer(
        &self,
        volunteer: &VolunteerIdentity,
    ) -> Result<Vec<RequestSummary>, RepoError> {
        let key = CacheKey::requests_of_volunteer(volunteer);
        self.cache
            .get_or_compute(&key, || self.store.list_requests_of_volunteer(volunteer))
            .await
    }

    pub async fn posts_of_org(&self, org_email: &str) -> Result<Vec<PostRecord>, RepoError> {
        let key = CacheKey::posts_of_org(org_email);
        let org_email = key.key().to_string();
        self.cache
            .get_or_compute(&key, || async move {
                self.store.list_posts_of_org(&org_email).await
            })
            .await
    }

    /// `None` results are not cached, so a post created later is visible
    /// immediately.
    pub async fn post_by_id(&self, post_id: i64) -> Result<Option<PostRecord>, RepoError> {
        let key = CacheKey::post_by_id(post_id);
        self.cache
            .get_or_compute(&key, || self.store.find_post(post_id))
            .await
    }
}
