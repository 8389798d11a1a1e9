//! Idempotent processing of delivered request commands.
//!
//! Each delivery runs the same state machine: decode, re-validate referents,
//! persist in one transaction, evict stale cache entries. Redelivering a
//! command that was already applied is detected through the store's unique
//! (volunteer, post) constraint and reported as [`Effect::AlreadyApplied`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::outcome::{DropReason, Effect, Outcome, classify_repo_error};
use super::repos::{RepoError, SignupStore};
use crate::broker::Envelope;
use crate::cache::CacheEvictor;
use crate::domain::commands::{CommandKind, CreateRequestCommand, DeleteRequestCommand};
use crate::domain::entities::NewSignupRequest;

/// Processes one delivered message into an [`Outcome`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn kind(&self) -> CommandKind;

    async fn handle(&self, envelope: &Envelope) -> Outcome;
}

#[derive(Clone)]
pub struct RequestConsumer {
    store: Arc<dyn SignupStore>,
    evictor: CacheEvictor,
}

impl RequestConsumer {
    pub fn new(store: Arc<dyn SignupStore>, evictor: CacheEvictor) -> Self {
        Self { store, evictor }
    }

    pub async fn handle_create(&self, payload: &[u8]) -> Outcome {
        let command = match CreateRequestCommand::decode(payload) {
            Ok(command) => command,
            Err(err) => return Outcome::Dropped(err.into()),
        };

        match self.store.find_post(command.post_id()).await {
            Ok(Some(_)) => {}
            Ok(None) => return Outcome::Dropped(DropReason::PostMissing),
            Err(err) => return classify_repo_error(err),
        }

        match self.store.find_volunteer(command.volunteer()).await {
            Ok(Some(_)) => {}
            Ok(None) => return Outcome::Dropped(DropReason::VolunteerMissing),
            Err(err) => return classify_repo_error(err),
        }

        let params = NewSignupRequest {
            post_id: command.post_id(),
            volunteer: command.volunteer().clone(),
            suggestion: command.suggestion().to_string(),
            requested_at: command.issued_at(),
        };

        let effect = match self.store.insert_request(params).await {
            Ok(record) => Effect::Created {
                request_id: record.id,
            },
            Err(RepoError::Duplicate { constraint }) => {
                debug!(
                    target = "vhub::application::consumer",
                    idempotency_key = %command.idempotency_key(),
                    constraint = %constraint,
                    "Request already persisted"
                );
                Effect::AlreadyApplied
            }
            Err(RepoError::NotFound) => return Outcome::Dropped(DropReason::PostMissing),
            Err(err) => return classify_repo_error(err),
        };

        // An earlier attempt may have committed without evicting.
        self.evictor
            .request_created(command.volunteer(), command.post_id())
            .await;
        Outcome::Processed(effect)
    }

    pub async fn handle_delete(&self, payload: &[u8]) -> Outcome {
        let command = match DeleteRequestCommand::decode(payload) {
            Ok(command) => command,
            Err(err) => return Outcome::Dropped(err.into()),
        };

        let withdrawn = match self.store.withdraw_request(command.request_id()).await {
            Ok(Some(withdrawn)) => withdrawn,
            Ok(None) => return Outcome::Dropped(DropReason::RequestMissing),
            Err(RepoError::NotFound) => return Outcome::Dropped(DropReason::RequestMissing),
            Err(err) => return classify_repo_error(err),
        };

        self.evictor
            .request_deleted(
                &withdrawn.request.volunteer,
                withdrawn.request.post_id,
                withdrawn.org_email.as_deref(),
                withdrawn.slot_restored,
            )
            .await;

        Outcome::Processed(Effect::Deleted {
            request_id: withdrawn.request.id,
            slot_restored: withdrawn.slot_restored,
        })
    }
}

/// Binds a [`RequestConsumer`] to one command kind.
#[derive(Clone)]
pub struct CommandHandler {
    consumer: Arc<RequestConsumer>,
    kind: CommandKind,
}

impl CommandHandler {
    pub fn new(consumer: Arc<RequestConsumer>, kind: CommandKind) -> Self {
        Self { consumer, kind }
    }
}

#[async_trait]
impl MessageHandler for CommandHandler {
    fn kind(&self) -> CommandKind {
        self.kind
    }

    async fn handle(&self, envelope: &Envelope) -> Outcome {
        match self.kind {
            CommandKind::Create => self.consumer.handle_create(&envelope.payload).await,
            CommandKind::Delete => self.consumer.handle_delete(&envelope.payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use time::macros::datetime;

    use super::*;
    use crate::cache::{CacheConfig, CacheKey, CacheStore, MemoryCacheStore, Namespace};
    use crate::domain::identity::VolunteerIdentity;
    use crate::domain::types::RequestStatus;
    use crate::infra::memory::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCacheStore>,
        consumer: RequestConsumer,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.seed_post(42, "Beach cleanup", "org@example.com", 3);
        store.seed_volunteer("alice@example.com", "Alice").expect("seed volunteer");
        let cache = Arc::new(MemoryCacheStore::new(&CacheConfig::default()));
        let consumer = RequestConsumer::new(store.clone(), CacheEvictor::new(cache.clone(), true));
        Fixture {
            store,
            cache,
            consumer,
        }
    }

    fn alice() -> VolunteerIdentity {
        VolunteerIdentity::parse("alice@example.com").expect("identity")
    }

    fn create_payload(post_id: i64) -> Bytes {
        CreateRequestCommand::new(alice(), post_id, "bring gloves", datetime!(2025-03-01 9:00 UTC))
            .expect("command")
            .encode()
            .expect("encode")
    }

    #[tokio::test]
    async fn redelivered_create_is_applied_once() {
        let fx = fixture();
        let payload = create_payload(42);

        let first = fx.consumer.handle_create(&payload).await;
        let second = fx.consumer.handle_create(&payload).await;

        assert!(matches!(first, Outcome::Processed(Effect::Created { .. })));
        assert_eq!(second, Outcome::Processed(Effect::AlreadyApplied));
        assert_eq!(fx.store.request_count(), 1);
    }

    #[tokio::test]
    async fn create_for_missing_post_is_dropped() {
        let fx = fixture();
        let outcome = fx.consumer.handle_create(&create_payload(7)).await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::PostMissing));
        assert_eq!(fx.store.request_count(), 0);
    }

    #[tokio::test]
    async fn create_for_unknown_volunteer_is_dropped() {
        let fx = fixture();
        let payload = CreateRequestCommand::new(
            VolunteerIdentity::parse("bob@example.com").expect("identity"),
            42,
            "",
            datetime!(2025-03-01 9:00 UTC),
        )
        .expect("command")
        .encode()
        .expect("encode");

        let outcome = fx.consumer.handle_create(&payload).await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::VolunteerMissing));
    }

    #[tokio::test]
    async fn garbage_payload_is_malformed() {
        let fx = fixture();
        let outcome = fx.consumer.handle_create(b"{\"postId\": ").await;
        assert!(matches!(outcome, Outcome::Dropped(DropReason::Malformed(_))));
        let outcome = fx.consumer.handle_delete(b"{\"requestId\": 0}").await;
        assert!(matches!(outcome, Outcome::Dropped(DropReason::Malformed(_))));
    }

    #[tokio::test]
    async fn transient_store_failure_is_retryable() {
        let fx = fixture();
        fx.store.fail_next(RepoError::Timeout);
        let outcome = fx.consumer.handle_create(&create_payload(42)).await;
        assert!(matches!(outcome, Outcome::Retryable(_)));
        assert_eq!(fx.store.request_count(), 0);
    }

    #[tokio::test]
    async fn create_evicts_volunteer_requests() {
        let fx = fixture();
        let key = CacheKey::requests_of_volunteer(&alice());
        fx.cache
            .put(&key, serde_json::json!([]), std::time::Duration::from_secs(45))
            .await
            .expect("put");

        fx.consumer.handle_create(&create_payload(42)).await;

        assert!(fx.cache.is_empty(Namespace::RequestsOfVolunteer));
    }

    #[tokio::test]
    async fn deleting_accepted_request_restores_slot() {
        let fx = fixture();
        let id = fx
            .store
            .seed_request(42, "alice@example.com", RequestStatus::Accepted)
            .expect("seed request");
        let payload = DeleteRequestCommand::new(id, datetime!(2025-03-02 9:00 UTC))
            .expect("command")
            .encode()
            .expect("encode");

        let outcome = fx.consumer.handle_delete(&payload).await;

        assert_eq!(
            outcome,
            Outcome::Processed(Effect::Deleted {
                request_id: id,
                slot_restored: true
            })
        );
        assert_eq!(fx.store.slots_of(42), Some(4));

        let again = fx.consumer.handle_delete(&payload).await;
        assert_eq!(again, Outcome::Dropped(DropReason::RequestMissing));
        assert_eq!(fx.store.slots_of(42), Some(4));
    }

    #[tokio::test]
    async fn deleting_pending_request_keeps_slots() {
        let fx = fixture();
        let id = fx
            .store
            .seed_request(42, "alice@example.com", RequestStatus::Pending)
            .expect("seed request");
        let payload = DeleteRequestCommand::new(id, datetime!(2025-03-02 9:00 UTC))
            .expect("command")
            .encode()
            .expect("encode");

        let outcome = fx.consumer.handle_delete(&payload).await;

        assert!(matches!(
            outcome,
            Outcome::Processed(Effect::Deleted {
                slot_restored: false,
                ..
            })
        ));
        assert_eq!(fx.store.slots_of(42), Some(3));
    }
}
