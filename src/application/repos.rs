//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{
    NewSignupRequest, PostRecord, RequestSummary, SignupRequestRecord, VolunteerRecord,
};
use crate::domain::identity::VolunteerIdentity;
use crate::domain::types::{Decision, RequestStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RepoError::Persistence(_) | RepoError::Timeout | RepoError::Unavailable(_)
        )
    }
}

/// Result of deleting a request together with its compensating slot update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawnRequest {
    pub request: SignupRequestRecord,
    /// Owner of the post, when the post still exists.
    pub org_email: Option<String>,
    /// True when the deleted request was accepted and a slot was handed back.
    pub slot_restored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecideRequestParams {
    pub request_id: i64,
    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    Decided {
        request: SignupRequestRecord,
        post: PostRecord,
    },
    NotFound,
    AlreadyDecided(RequestStatus),
    NoSlots,
}

#[async_trait]
pub trait PostsRepo: Send + Sync {
    async fn find_post(&self, id: i64) -> Result<Option<PostRecord>, RepoError>;

    /// Decrements only while slots remain; returns the number of rows changed.
    async fn decrement_available_slots(&self, id: i64) -> Result<u64, RepoError>;

    async fn increment_available_slots(&self, id: i64) -> Result<u64, RepoError>;

    async fn list_posts_of_org(&self, org_email: &str) -> Result<Vec<PostRecord>, RepoError>;
}

#[async_trait]
pub trait VolunteersRepo: Send + Sync {
    async fn find_volunteer(
        &self,
        identity: &VolunteerIdentity,
    ) -> Result<Option<VolunteerRecord>, RepoError>;
}

#[async_trait]
pub trait RequestsRepo: Send + Sync {
    async fn find_request(&self, id: i64) -> Result<Option<SignupRequestRecord>, RepoError>;

    /// Fails with [`RepoError::Duplicate`] when the volunteer already has a
    /// request for the post.
    async fn insert_request(
        &self,
        params: NewSignupRequest,
    ) -> Result<SignupRequestRecord, RepoError>;

    async fn delete_request(&self, id: i64) -> Result<u64, RepoError>;

    /// Deletes the request and, when it was accepted, returns its slot to the
    /// post within the same transaction. `None` when the row is already gone.
    async fn withdraw_request(&self, id: i64) -> Result<Option<WithdrawnRequest>, RepoError>;

    /// Applies a decision to a pending request; approval decrements the post's
    /// slots in the same transaction.
    async fn decide_request(
        &self,
        params: DecideRequestParams,
    ) -> Result<DecisionOutcome, RepoError>;

    async fn list_requests_of_volunteer(
        &self,
        volunteer: &VolunteerIdentity,
    ) -> Result<Vec<RequestSummary>, RepoError>;
}

/// Everything the pipeline reads and writes, implemented by each adapter.
pub trait SignupStore: PostsRepo + VolunteersRepo + RequestsRepo {}

impl<T> SignupStore for T where T: PostsRepo + VolunteersRepo + RequestsRepo {}
