//! Message broker port and adapters.
//!
//! The pipeline only relies on AMQP 0-9-1 semantics: direct exchanges,
//! durable queues, per-queue dead-letter targets, per-queue message TTLs and
//! manual acknowledgement. [`MemoryBroker`] reproduces those semantics in
//! process; `AmqpBroker` (feature `amqp`) talks to RabbitMQ.

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod envelope;
pub mod memory;
pub mod topology;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use envelope::{DeathReason, DeathRecord, DeliveryHeaders, Envelope, JSON_CONTENT_TYPE};
pub use memory::{BrokerEvent, MemoryBroker};
pub use topology::{BindingDecl, CommandRoute, ExchangeDecl, QueueDecl, RetryTier, Topology};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("exchange `{0}` is not declared")]
    UnknownExchange(String),
    #[error("queue `{0}` is not declared")]
    UnknownQueue(String),
    #[error("message to `{exchange}` with key `{routing_key}` matched no queue")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },
    #[error("broker refused the message: {0}")]
    Nacked(String),
    #[error("broker transport failure: {0}")]
    Transport(String),
    #[error("broker connection closed")]
    Closed,
}

impl BrokerError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotently declares every exchange, queue and binding.
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError>;

    /// Publishes and waits for the broker to take responsibility for the
    /// message. A message that matches no binding is an error.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Envelope,
    ) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Number of ready messages in `queue`.
    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Next delivery; `None` once the broker connection is closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgement without requeue: the queue dead-letters the
    /// message to its configured target, or discards it when it has none.
    async fn reject(&self) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, settled exactly once via [`Delivery::ack`]
/// or [`Delivery::reject`].
pub struct Delivery {
    envelope: Envelope,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: Box<dyn Acknowledger>) -> Self {
        Self { envelope, acker }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> Result<(), BrokerError> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.envelope.message_id)
            .field("routing_key", &self.envelope.routing_key)
            .field("redelivered", &self.envelope.redelivered)
            .finish()
    }
}
