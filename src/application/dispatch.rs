//! Translation of handler outcomes into broker settlements.
//!
//! | Outcome                              | Settlement                     |
//! |--------------------------------------|--------------------------------|
//! | `Processed`                          | ack                            |
//! | `Dropped` (malformed, missing)       | ack                            |
//! | `Dropped` (poison)                   | terminal queue, then ack       |
//! | `Retryable`, attempts left           | reject into the retry chain    |
//! | `Retryable`, attempts exhausted      | terminal queue, then ack       |

use std::sync::Arc;

use metrics::counter;
use tracing::{error, warn};

use super::outcome::{DropReason, Outcome};
use crate::broker::{Broker, BrokerError, CommandRoute, Delivery, Envelope};
use crate::config::RetrySettings;

const METRIC_DEAD_LETTER: &str = "vhub_pipeline_dead_letter_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total processing attempts on the primary queue.
    pub max_attempts: u32,
    /// Forward malformed payloads to the terminal queue instead of dropping.
    pub quarantine_malformed: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.get(),
            quarantine_malformed: settings.quarantine_malformed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Rejected { attempt: u32 },
    Quarantined { attempt: u32 },
}

/// 1-based attempt number of a delivery on `primary_queue`.
pub fn attempt_of(envelope: &Envelope, primary_queue: &str) -> u32 {
    let rejections = u32::try_from(envelope.rejections_from(primary_queue)).unwrap_or(u32::MAX);
    rejections.saturating_add(1)
}

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    route: CommandRoute,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, route: CommandRoute, policy: RetryPolicy) -> Self {
        Self {
            broker,
            route,
            policy,
        }
    }

    pub fn route(&self) -> &CommandRoute {
        &self.route
    }

    /// Settles `delivery` exactly once according to `outcome`.
    pub async fn settle(
        &self,
        delivery: Delivery,
        outcome: &Outcome,
    ) -> Result<Settlement, BrokerError> {
        let attempt = attempt_of(delivery.envelope(), &self.route.queue);

        match outcome {
            Outcome::Processed(_) => {
                delivery.ack().await?;
                Ok(Settlement::Acked)
            }
            Outcome::Dropped(reason @ DropReason::Poison(_)) => {
                self.quarantine(delivery, attempt, &reason.describe()).await
            }
            Outcome::Dropped(reason @ DropReason::Malformed(_))
                if self.policy.quarantine_malformed =>
            {
                self.quarantine(delivery, attempt, &reason.describe()).await
            }
            Outcome::Dropped(_) => {
                delivery.ack().await?;
                Ok(Settlement::Acked)
            }
            Outcome::Retryable(_) if attempt < self.policy.max_attempts => {
                delivery.reject().await?;
                Ok(Settlement::Rejected { attempt })
            }
            Outcome::Retryable(err) => self.quarantine(delivery, attempt, &err.to_string()).await,
        }
    }

    /// Publishes a copy to the terminal exchange and acks the original. When
    /// the copy cannot be published the original is rejected into the retry
    /// chain so it is never lost.
    async fn quarantine(
        &self,
        delivery: Delivery,
        attempt: u32,
        final_error: &str,
    ) -> Result<Settlement, BrokerError> {
        let copy = delivery.envelope().quarantined(final_error);
        let message_id = copy.message_id.clone();

        match self
            .broker
            .publish(
                &self.route.terminal_exchange,
                &self.route.terminal_routing_key,
                copy,
            )
            .await
        {
            Ok(()) => {
                delivery.ack().await?;
                counter!(METRIC_DEAD_LETTER, "kind" => self.route.kind.as_str()).increment(1);
                error!(
                    target = "vhub::application::dispatch",
                    kind = self.route.kind.as_str(),
                    message_id = %message_id,
                    attempt,
                    final_error,
                    terminal_exchange = %self.route.terminal_exchange,
                    "Message moved to dead-letter queue"
                );
                Ok(Settlement::Quarantined { attempt })
            }
            Err(err) => {
                warn!(
                    target = "vhub::application::dispatch",
                    kind = self.route.kind.as_str(),
                    message_id = %message_id,
                    attempt,
                    error = %err,
                    "Dead-letter publish failed; rejecting into retry chain"
                );
                delivery.reject().await?;
                Ok(Settlement::Rejected { attempt })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use time::macros::datetime;

    use super::*;
    use crate::application::outcome::{Effect, RetryableError};
    use crate::application::repos::RepoError;
    use crate::broker::{DeathReason, MemoryBroker, Subscription, Topology};
    use crate::config::BrokerSettings;
    use crate::domain::commands::CommandKind;

    async fn setup(policy: RetryPolicy) -> (MemoryBroker, Topology, Dispatcher) {
        let broker = MemoryBroker::new();
        let topology = Topology::build(&BrokerSettings::default());
        broker.declare(&topology).await.expect("declare");
        let route = topology.route(CommandKind::Create).clone();
        let dispatcher = Dispatcher::new(Arc::new(broker.clone()), route, policy);
        (broker, topology, dispatcher)
    }

    async fn deliver(broker: &MemoryBroker, route: &CommandRoute) -> Delivery {
        broker
            .publish(
                &route.exchange,
                &route.routing_key,
                Envelope::json(Bytes::from_static(b"{}")),
            )
            .await
            .expect("publish");
        let mut subscription = broker.subscribe(&route.queue, 1).await.expect("subscribe");
        subscription
            .next_delivery()
            .await
            .expect("delivery")
            .expect("ok")
    }

    fn retryable() -> Outcome {
        Outcome::Retryable(RetryableError::Store(RepoError::Timeout))
    }

    #[test]
    fn attempt_counts_primary_rejections() {
        let mut envelope = Envelope::json(Bytes::from_static(b"{}"));
        assert_eq!(attempt_of(&envelope, "q"), 1);
        envelope.record_death("q", DeathReason::Rejected, datetime!(2025-01-01 0:00 UTC));
        envelope.record_death("q.retry.1", DeathReason::Expired, datetime!(2025-01-01 0:00 UTC));
        assert_eq!(attempt_of(&envelope, "q"), 2);
    }

    #[tokio::test]
    async fn processed_and_missing_referents_are_acked() {
        let (broker, topology, dispatcher) = setup(RetryPolicy::default()).await;
        let route = topology.route(CommandKind::Create);

        let delivery = deliver(&broker, route).await;
        let settled = dispatcher
            .settle(delivery, &Outcome::Processed(Effect::AlreadyApplied))
            .await
            .expect("settle");
        assert_eq!(settled, Settlement::Acked);

        let delivery = deliver(&broker, route).await;
        let settled = dispatcher
            .settle(delivery, &Outcome::Dropped(DropReason::PostMissing))
            .await
            .expect("settle");
        assert_eq!(settled, Settlement::Acked);
        assert!(broker.ready_messages(topology.terminal_queue()).is_empty());
    }

    #[tokio::test]
    async fn first_failure_is_rejected_into_tier_one() {
        let (broker, topology, dispatcher) = setup(RetryPolicy::default()).await;
        let route = topology.route(CommandKind::Create);

        let delivery = deliver(&broker, route).await;
        let settled = dispatcher.settle(delivery, &retryable()).await.expect("settle");

        assert_eq!(settled, Settlement::Rejected { attempt: 1 });
        assert_eq!(broker.ready_messages(&route.tiers[0].queue).len(), 1);
    }

    #[tokio::test]
    async fn poison_is_quarantined_with_final_error() {
        let (broker, topology, dispatcher) = setup(RetryPolicy::default()).await;
        let route = topology.route(CommandKind::Create);

        let delivery = deliver(&broker, route).await;
        let settled = dispatcher
            .settle(
                delivery,
                &Outcome::Dropped(DropReason::Poison("check violation".into())),
            )
            .await
            .expect("settle");

        assert_eq!(settled, Settlement::Quarantined { attempt: 1 });
        let dead = broker.ready_messages(topology.terminal_queue());
        assert_eq!(dead.len(), 1);
        assert!(
            dead[0]
                .headers
                .final_error
                .as_deref()
                .is_some_and(|error| error.contains("check violation"))
        );
    }

    #[tokio::test]
    async fn malformed_quarantine_is_opt_in() {
        let policy = RetryPolicy {
            quarantine_malformed: true,
            ..RetryPolicy::default()
        };
        let (broker, topology, dispatcher) = setup(policy).await;
        let route = topology.route(CommandKind::Create);

        let delivery = deliver(&broker, route).await;
        let settled = dispatcher
            .settle(delivery, &Outcome::Dropped(DropReason::Malformed("eof".into())))
            .await
            .expect("settle");

        assert_eq!(settled, Settlement::Quarantined { attempt: 1 });
        assert_eq!(broker.ready_messages(topology.terminal_queue()).len(), 1);
    }

    #[tokio::test]
    async fn single_attempt_policy_quarantines_immediately() {
        let policy = RetryPolicy {
            max_attempts: 1,
            quarantine_malformed: false,
        };
        let (broker, topology, dispatcher) = setup(policy).await;
        let route = topology.route(CommandKind::Create);

        let delivery = deliver(&broker, route).await;
        let settled = dispatcher.settle(delivery, &retryable()).await.expect("settle");

        assert_eq!(settled, Settlement::Quarantined { attempt: 1 });
        assert!(broker.ready_messages(&route.tiers[0].queue).is_empty());
        assert_eq!(broker.ready_messages(topology.terminal_queue()).len(), 1);
    }
}
