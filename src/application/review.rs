//! Organizer review of pending sign-up requests.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use super::repos::{DecideRequestParams, DecisionOutcome, RepoError, SignupStore};
use crate::cache::CacheEvictor;
use crate::domain::entities::SignupRequestRecord;
use crate::domain::types::{Decision, RequestStatus};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("request not found")]
    NotFound,
    #[error("caller does not own the post")]
    Forbidden,
    #[error("request was already {status}")]
    AlreadyDecided { status: RequestStatus },
    #[error("post has no available slots")]
    NoSlots,
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Clone)]
pub struct ReviewService {
    store: Arc<dyn SignupStore>,
    evictor: CacheEvictor,
}

impl ReviewService {
    pub fn new(store: Arc<dyn SignupStore>, evictor: CacheEvictor) -> Self {
        Self { store, evictor }
    }

    pub async fn approve(
        &self,
        organizer: &str,
        request_id: i64,
    ) -> Result<SignupRequestRecord, ReviewError> {
        self.decide(organizer, request_id, Decision::Approve).await
    }

    pub async fn reject(
        &self,
        organizer: &str,
        request_id: i64,
    ) -> Result<SignupRequestRecord, ReviewError> {
        self.decide(organizer, request_id, Decision::Reject).await
    }

    async fn decide(
        &self,
        organizer: &str,
        request_id: i64,
        decision: Decision,
    ) -> Result<SignupRequestRecord, ReviewError> {
        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or(ReviewError::NotFound)?;
        let post = self
            .store
            .find_post(request.post_id)
            .await?
            .ok_or(ReviewError::NotFound)?;

        if !post.is_owned_by(organizer) {
            return Err(ReviewError::Forbidden);
        }
        if !request.status.is_pending() {
            return Err(ReviewError::AlreadyDecided {
                status: request.status,
            });
        }

        let params = DecideRequestParams {
            request_id,
            decision,
        };
        let (request, post) = match self.store.decide_request(params).await? {
            DecisionOutcome::Decided { request, post } => (request, post),
            DecisionOutcome::NotFound => return Err(ReviewError::NotFound),
            DecisionOutcome::AlreadyDecided(status) => {
                return Err(ReviewError::AlreadyDecided { status });
            }
            DecisionOutcome::NoSlots => return Err(ReviewError::NoSlots),
        };

        let slots_changed = matches!(decision, Decision::Approve);
        self.evictor
            .request_reviewed(&request.volunteer, &post, slots_changed)
            .await;

        info!(
            target = "vhub::application::review",
            request_id,
            post_id = post.id,
            decision = decision.as_str(),
            available_slots = post.available_slots,
            "Request reviewed"
        );
        Ok(request)
    }
}
