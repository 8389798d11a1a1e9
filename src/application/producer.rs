//! Command producer used by the request-submission entry points.
//!
//! The producer never writes to the store. It resolves the route for the
//! command kind, publishes a persistent JSON message and waits for the broker
//! to confirm it. Callers receive [`Accepted`] or a publish-time failure.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use super::repos::SignupStore;
use super::resilience::{CircuitBreaker, CircuitBreakerConfig};
use crate::broker::{Broker, BrokerError, CommandRoute, Envelope, Topology};
use crate::config::ProducerSettings;
use crate::domain::commands::{
    CommandKind, CreateRequestCommand, DeleteRequestCommand, IdempotencyKey,
};
use crate::domain::error::DomainError;
use crate::domain::identity::VolunteerIdentity;

const METRIC_PUBLISH: &str = "vhub_producer_publish_total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub message_id: String,
    /// Present for create commands; deletes are keyed by request id.
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("invalid command: {0}")]
    Invalid(String),
    #[error("post {0} does not exist")]
    PostNotFound(i64),
    #[error("broker did not confirm within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("publishing is temporarily unavailable")]
    Unavailable,
    #[error("command could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<DomainError> for EnqueueError {
    fn from(err: DomainError) -> Self {
        EnqueueError::Invalid(err.to_string())
    }
}

pub struct RequestProducer {
    broker: Arc<dyn Broker>,
    store: Arc<dyn SignupStore>,
    create_route: CommandRoute,
    delete_route: CommandRoute,
    settings: ProducerSettings,
    breaker: CircuitBreaker,
}

impl RequestProducer {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn SignupStore>,
        topology: &Topology,
        settings: ProducerSettings,
    ) -> Self {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: settings.failure_threshold.get(),
            open_cooldown: settings.open_cooldown,
        });
        Self {
            broker,
            store,
            create_route: topology.route(CommandKind::Create).clone(),
            delete_route: topology.route(CommandKind::Delete).clone(),
            settings,
            breaker,
        }
    }

    pub async fn enqueue_create(
        &self,
        volunteer: VolunteerIdentity,
        post_id: i64,
        suggestion: impl Into<String>,
    ) -> Result<Accepted, EnqueueError> {
        let command =
            CreateRequestCommand::new(volunteer, post_id, suggestion, OffsetDateTime::now_utc())?;

        if self.settings.precheck_post {
            self.precheck_post(post_id).await?;
        }

        let message_id = self.publish(&self.create_route, command.encode()?).await?;
        Ok(Accepted {
            message_id,
            idempotency_key: Some(command.idempotency_key().clone()),
        })
    }

    pub async fn enqueue_delete(&self, request_id: i64) -> Result<Accepted, EnqueueError> {
        let command = DeleteRequestCommand::new(request_id, OffsetDateTime::now_utc())?;
        let message_id = self.publish(&self.delete_route, command.encode()?).await?;
        Ok(Accepted {
            message_id,
            idempotency_key: None,
        })
    }

    /// Best-effort: only a definite "no such post" rejects the submission.
    async fn precheck_post(&self, post_id: i64) -> Result<(), EnqueueError> {
        match self.store.find_post(post_id).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(EnqueueError::PostNotFound(post_id)),
            Err(err) => {
                warn!(
                    target = "vhub::application::producer",
                    post_id,
                    error = %err,
                    "Post precheck failed; deferring validation to the consumer"
                );
                Ok(())
            }
        }
    }

    async fn publish(&self, route: &CommandRoute, payload: Bytes) -> Result<String, EnqueueError> {
        let kind = route.kind.as_str();
        if !self.breaker.admit() {
            counter!(METRIC_PUBLISH, "kind" => kind, "result" => "unavailable").increment(1);
            return Err(EnqueueError::Unavailable);
        }

        let envelope = Envelope::json(payload);
        let message_id = envelope.message_id.clone();
        let publish = self
            .broker
            .publish(&route.exchange, &route.routing_key, envelope);

        match tokio::time::timeout(self.settings.publish_timeout, publish).await {
            Ok(Ok(())) => {
                self.breaker.record_success();
                counter!(METRIC_PUBLISH, "kind" => kind, "result" => "ok").increment(1);
                info!(
                    target = "vhub::application::producer",
                    kind,
                    message_id = %message_id,
                    routing_key = %route.routing_key,
                    "Command enqueued"
                );
                Ok(message_id)
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                counter!(METRIC_PUBLISH, "kind" => kind, "result" => "error").increment(1);
                warn!(
                    target = "vhub::application::producer",
                    kind,
                    message_id = %message_id,
                    error = %err,
                    "Command publish failed"
                );
                Err(EnqueueError::Broker(err))
            }
            Err(_) => {
                self.breaker.record_failure();
                counter!(METRIC_PUBLISH, "kind" => kind, "result" => "timeout").increment(1);
                warn!(
                    target = "vhub::application::producer",
                    kind,
                    message_id = %message_id,
                    timeout_ms = self.settings.publish_timeout.as_millis() as u64,
                    "Command publish timed out"
                );
                Err(EnqueueError::Timeout(self.settings.publish_timeout))
            }
        }
    }
}
