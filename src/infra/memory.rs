//! In-process entity store.
//!
//! Mirrors the Postgres adapter's constraints: one request per (volunteer,
//! post), slots never negative, and withdraw/decide applied atomically under
//! a single lock. Used by `serve` when no database is configured and by tests,
//! which can also queue failures with [`MemoryStore::fail_next`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::application::repos::{
    DecideRequestParams, DecisionOutcome, PostsRepo, RepoError, RequestsRepo, VolunteersRepo,
    WithdrawnRequest,
};
use crate::domain::entities::{
    NewSignupRequest, PostRecord, RequestSummary, SignupRequestRecord, VolunteerRecord,
};
use crate::domain::error::DomainError;
use crate::domain::identity::VolunteerIdentity;
use crate::domain::types::{Decision, RequestStatus};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "infra::memory";
const UNIQUE_REQUEST_CONSTRAINT: &str = "volunteer_requests_volunteer_post_key";

#[derive(Default)]
struct State {
    posts: BTreeMap<i64, PostRecord>,
    volunteers: HashMap<VolunteerIdentity, VolunteerRecord>,
    requests: BTreeMap<i64, SignupRequestRecord>,
    next_request_id: i64,
}

impl State {
    fn find_by_pair(&self, volunteer: &VolunteerIdentity, post_id: i64) -> Option<i64> {
        self.requests
            .values()
            .find(|request| request.post_id == post_id && &request.volunteer == volunteer)
            .map(|request| request.id)
    }

    fn allocate_request_id(&mut self) -> i64 {
        self.next_request_id += 1;
        self.next_request_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    faults: Mutex<VecDeque<RepoError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_post(
        &self,
        id: i64,
        title: &str,
        org_email: &str,
        available_slots: i32,
    ) -> PostRecord {
        let post = PostRecord {
            id,
            title: title.to_string(),
            category: None,
            location: None,
            org_email: org_email.to_string(),
            available_slots: available_slots.max(0),
        };
        mutex_lock(&self.state, SOURCE, "seed_post")
            .posts
            .insert(id, post.clone());
        post
    }

    pub fn seed_volunteer(
        &self,
        email: &str,
        display_name: &str,
    ) -> Result<VolunteerIdentity, DomainError> {
        let identity = VolunteerIdentity::parse(email)?;
        let record = VolunteerRecord {
            identity: identity.clone(),
            display_name: display_name.to_string(),
        };
        mutex_lock(&self.state, SOURCE, "seed_volunteer")
            .volunteers
            .insert(identity.clone(), record);
        Ok(identity)
    }

    /// Inserts a request directly, bypassing the pipeline; returns its id.
    pub fn seed_request(
        &self,
        post_id: i64,
        email: &str,
        status: RequestStatus,
    ) -> Result<i64, DomainError> {
        let volunteer = VolunteerIdentity::parse(email)?;
        let mut state = mutex_lock(&self.state, SOURCE, "seed_request");
        if state.find_by_pair(&volunteer, post_id).is_some() {
            return Err(DomainError::invariant(
                "volunteer already has a request for this post",
            ));
        }
        let id = state.allocate_request_id();
        state.requests.insert(
            id,
            SignupRequestRecord {
                id,
                post_id,
                volunteer,
                suggestion: String::new(),
                status,
                requested_at: time::OffsetDateTime::now_utc(),
            },
        );
        Ok(id)
    }

    /// The next repository call fails with `err`. Queued failures are consumed
    /// in order, one per call.
    pub fn fail_next(&self, err: RepoError) {
        mutex_lock(&self.faults, SOURCE, "fail_next").push_back(err);
    }

    pub fn request_count(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "request_count")
            .requests
            .len()
    }

    pub fn request_for(
        &self,
        volunteer: &VolunteerIdentity,
        post_id: i64,
    ) -> Option<SignupRequestRecord> {
        let state = mutex_lock(&self.state, SOURCE, "request_for");
        state
            .find_by_pair(volunteer, post_id)
            .and_then(|id| state.requests.get(&id).cloned())
    }

    pub fn slots_of(&self, post_id: i64) -> Option<i32> {
        mutex_lock(&self.state, SOURCE, "slots_of")
            .posts
            .get(&post_id)
            .map(|post| post.available_slots)
    }

    fn injected_fault(&self) -> Result<(), RepoError> {
        match mutex_lock(&self.faults, SOURCE, "injected_fault").pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PostsRepo for MemoryStore {
    async fn find_post(&self, id: i64) -> Result<Option<PostRecord>, RepoError> {
        self.injected_fault()?;
        Ok(mutex_lock(&self.state, SOURCE, "find_post")
            .posts
            .get(&id)
            .cloned())
    }

    async fn decrement_available_slots(&self, id: i64) -> Result<u64, RepoError> {
        self.injected_fault()?;
        let mut state = mutex_lock(&self.state, SOURCE, "decrement_available_slots");
        match state.posts.get_mut(&id) {
            Some(post) if post.available_slots > 0 => {
                post.available_slots -= 1;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn increment_available_slots(&self, id: i64) -> Result<u64, RepoError> {
        self.injected_fault()?;
        let mut state = mutex_lock(&self.state, SOURCE, "increment_available_slots");
        match state.posts.get_mut(&id) {
            Some(post) => {
                post.available_slots = post.available_slots.saturating_add(1);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn list_posts_of_org(&self, org_email: &str) -> Result<Vec<PostRecord>, RepoError> {
        self.injected_fault()?;
        Ok(mutex_lock(&self.state, SOURCE, "list_posts_of_org")
            .posts
            .values()
            .rev()
            .filter(|post| post.is_owned_by(org_email))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VolunteersRepo for MemoryStore {
    async fn find_volunteer(
        &self,
        identity: &VolunteerIdentity,
    ) -> Result<Option<VolunteerRecord>, RepoError> {
        self.injected_fault()?;
        Ok(mutex_lock(&self.state, SOURCE, "find_volunteer")
            .volunteers
            .get(identity)
            .cloned())
    }
}

#[async_trait]
impl RequestsRepo for MemoryStore {
    async fn find_request(&self, id: i64) -> Result<Option<SignupRequestRecord>, RepoError> {
        self.injected_fault()?;
        Ok(mutex_lock(&self.state, SOURCE, "find_request")
            .requests
            .get(&id)
            .cloned())
    }

    async fn insert_request(
        &self,
        params: NewSignupRequest,
    ) -> Result<SignupRequestRecord, RepoError> {
        self.injected_fault()?;
        let mut state = mutex_lock(&self.state, SOURCE, "insert_request");

        if !state.posts.contains_key(&params.post_id)
            || !state.volunteers.contains_key(&params.volunteer)
        {
            return Err(RepoError::NotFound);
        }
        if state
            .find_by_pair(&params.volunteer, params.post_id)
            .is_some()
        {
            return Err(RepoError::Duplicate {
                constraint: UNIQUE_REQUEST_CONSTRAINT.to_string(),
            });
        }

        let id = state.allocate_request_id();
        let record = SignupRequestRecord {
            id,
            post_id: params.post_id,
            volunteer: params.volunteer,
            suggestion: params.suggestion,
            status: RequestStatus::Pending,
            requested_at: params.requested_at,
        };
        state.requests.insert(id, record.clone());
        Ok(record)
    }

    async fn delete_request(&self, id: i64) -> Result<u64, RepoError> {
        self.injected_fault()?;
        let removed = mutex_lock(&self.state, SOURCE, "delete_request")
            .requests
            .remove(&id)
            .is_some();
        Ok(u64::from(removed))
    }

    async fn withdraw_request(&self, id: i64) -> Result<Option<WithdrawnRequest>, RepoError> {
        self.injected_fault()?;
        let mut state = mutex_lock(&self.state, SOURCE, "withdraw_request");

        let Some(request) = state.requests.remove(&id) else {
            return Ok(None);
        };

        let (org_email, slot_restored) = match state.posts.get_mut(&request.post_id) {
            Some(post) => {
                let restore = request.status == RequestStatus::Accepted;
                if restore {
                    post.available_slots = post.available_slots.saturating_add(1);
                }
                (Some(post.org_email.clone()), restore)
            }
            None => (None, false),
        };

        Ok(Some(WithdrawnRequest {
            request,
            org_email,
            slot_restored,
        }))
    }

    async fn decide_request(
        &self,
        params: DecideRequestParams,
    ) -> Result<DecisionOutcome, RepoError> {
        self.injected_fault()?;
        let mut state = mutex_lock(&self.state, SOURCE, "decide_request");
        let State {
            posts, requests, ..
        } = &mut *state;

        let Some(request) = requests.get_mut(&params.request_id) else {
            return Ok(DecisionOutcome::NotFound);
        };
        if !request.status.is_pending() {
            return Ok(DecisionOutcome::AlreadyDecided(request.status));
        }
        let Some(post) = posts.get_mut(&request.post_id) else {
            return Ok(DecisionOutcome::NotFound);
        };

        if params.decision == Decision::Approve {
            if post.available_slots <= 0 {
                return Ok(DecisionOutcome::NoSlots);
            }
            post.available_slots -= 1;
        }
        request.status = params.decision.target_status();

        Ok(DecisionOutcome::Decided {
            request: request.clone(),
            post: post.clone(),
        })
    }

    async fn list_requests_of_volunteer(
        &self,
        volunteer: &VolunteerIdentity,
    ) -> Result<Vec<RequestSummary>, RepoError> {
        self.injected_fault()?;
        let state = mutex_lock(&self.state, SOURCE, "list_requests_of_volunteer");

        let mut summaries: Vec<RequestSummary> = state
            .requests
            .values()
            .filter(|request| &request.volunteer == volunteer)
            .filter_map(|request| {
                let post = state.posts.get(&request.post_id)?;
                Some(RequestSummary {
                    request_id: request.id,
                    post_id: post.id,
                    post_title: post.title.clone(),
                    org_email: post.org_email.clone(),
                    category: post.category.clone(),
                    location: post.location.clone(),
                    status: request.status,
                    suggestion: request.suggestion.clone(),
                    requested_at: request.requested_at,
                })
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.requested_at
                .cmp(&a.requested_at)
                .then(b.request_id.cmp(&a.request_id))
        });
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.seed_post(42, "Beach cleanup", "org@example.com", 1);
        store
            .seed_volunteer("alice@example.com", "Alice")
            .expect("seed volunteer");
        store
    }

    fn new_request() -> NewSignupRequest {
        NewSignupRequest {
            post_id: 42,
            volunteer: VolunteerIdentity::parse("alice@example.com").expect("identity"),
            suggestion: String::new(),
            requested_at: datetime!(2025-03-01 9:00 UTC),
        }
    }

    #[tokio::test]
    async fn second_insert_for_same_pair_is_duplicate() {
        let store = store();
        store.insert_request(new_request()).await.expect("insert");
        let err = store
            .insert_request(new_request())
            .await
            .expect_err("duplicate");
        assert!(matches!(err, RepoError::Duplicate { .. }));
        assert_eq!(store.request_count(), 1);
    }

    #[tokio::test]
    async fn slots_never_go_negative() {
        let store = store();
        assert_eq!(store.decrement_available_slots(42).await.expect("dec"), 1);
        assert_eq!(store.decrement_available_slots(42).await.expect("dec"), 0);
        assert_eq!(store.slots_of(42), Some(0));
    }

    #[tokio::test]
    async fn increment_returns_a_slot_to_existing_posts_only() {
        let store = store();
        assert_eq!(store.increment_available_slots(42).await.expect("inc"), 1);
        assert_eq!(store.slots_of(42), Some(2));
        assert_eq!(store.increment_available_slots(7).await.expect("inc"), 0);
        assert_eq!(store.slots_of(7), None);
    }

    #[tokio::test]
    async fn deciding_a_request_whose_post_is_gone_is_not_found() {
        let store = store();
        let id = store
            .seed_request(7, "alice@example.com", RequestStatus::Pending)
            .expect("seed request");
        for decision in [Decision::Approve, Decision::Reject] {
            let outcome = store
                .decide_request(DecideRequestParams {
                    request_id: id,
                    decision,
                })
                .await
                .expect("decide");
            assert_eq!(outcome, DecisionOutcome::NotFound);
        }
    }

    #[tokio::test]
    async fn injected_faults_apply_once() {
        let store = store();
        store.fail_next(RepoError::Timeout);
        assert_eq!(store.find_post(42).await, Err(RepoError::Timeout));
        assert!(store.find_post(42).await.expect("find").is_some());
    }

    #[tokio::test]
    async fn approval_consumes_the_last_slot_only_once() {
        let store = store();
        store
            .seed_volunteer("bob@example.com", "Bob")
            .expect("seed volunteer");
        let first = store
            .seed_request(42, "alice@example.com", RequestStatus::Pending)
            .expect("seed request");
        let second = store
            .seed_request(42, "bob@example.com", RequestStatus::Pending)
            .expect("seed request");

        let approve = |request_id| DecideRequestParams {
            request_id,
            decision: Decision::Approve,
        };
        assert!(matches!(
            store.decide_request(approve(first)).await.expect("decide"),
            DecisionOutcome::Decided { .. }
        ));
        assert_eq!(
            store.decide_request(approve(second)).await.expect("decide"),
            DecisionOutcome::NoSlots
        );
        assert_eq!(
            store.decide_request(approve(first)).await.expect("decide"),
            DecisionOutcome::AlreadyDecided(RequestStatus::Accepted)
        );
    }
}
