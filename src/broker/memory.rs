//! In-process broker with AMQP dead-letter and TTL semantics.
//!
//! Queues are FIFO buffers of ready messages. A delivery stays unacked until
//! it is settled; dropping an unsettled delivery puts it back at the head of
//! its queue flagged as redelivered, like a channel closing on a real broker.
//! Messages published to a queue with a TTL are dead-lettered when the TTL
//! elapses on the tokio clock, so paused-clock tests observe real backoff.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, warn};

use super::{
    Acknowledger, BindingDecl, Broker, BrokerError, DeathReason, Delivery, Envelope, QueueDecl,
    Subscription, Topology,
};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "broker::memory";
const EVENT_CAPACITY: usize = 4_096;

/// Observable broker activity, mainly for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Enqueued {
        queue: String,
        message_id: String,
        routing_key: String,
    },
    Delivered {
        queue: String,
        message_id: String,
    },
    Acked {
        queue: String,
        message_id: String,
    },
    Rejected {
        queue: String,
        message_id: String,
    },
    Expired {
        queue: String,
        message_id: String,
    },
    Requeued {
        queue: String,
        message_id: String,
    },
    Discarded {
        queue: String,
        message_id: String,
    },
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    /// Exchange name to its bindings.
    exchanges: DashMap<String, Vec<BindingDecl>>,
    queues: DashMap<String, Arc<QueueState>>,
    events: broadcast::Sender<BrokerEvent>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

struct QueueState {
    decl: QueueDecl,
    ready: Mutex<VecDeque<Stored>>,
    notify: Notify,
}

struct Stored {
    seq: u64,
    envelope: Envelope,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                exchanges: DashMap::new(),
                queues: DashMap::new(),
                events,
                sequence: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the ready messages of `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Envelope> {
        match self.inner.queue(queue) {
            Some(state) => mutex_lock(&state.ready, SOURCE, "ready_messages")
                .iter()
                .map(|stored| stored.envelope.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Stops deliveries: open subscriptions return `None` and publishes fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for entry in self.inner.queues.iter() {
            entry.value().notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Inner {
    fn emit(&self, event: BrokerEvent) {
        // No receivers is the normal case outside tests.
        let _ = self.events.send(event);
    }

    fn queue(&self, name: &str) -> Option<Arc<QueueState>> {
        self.queues.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn resolve(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Vec<Arc<QueueState>>, BrokerError> {
        let bindings = self
            .exchanges
            .get(exchange)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        Ok(bindings
            .iter()
            .filter(|binding| binding.routing_key == routing_key)
            .filter_map(|binding| self.queue(&binding.queue))
            .collect())
    }

    fn enqueue(
        self: &Arc<Self>,
        queue: &Arc<QueueState>,
        mut envelope: Envelope,
        exchange: &str,
        routing_key: &str,
    ) {
        envelope.exchange = exchange.to_string();
        envelope.routing_key = routing_key.to_string();
        envelope.redelivered = false;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let message_id = envelope.message_id.clone();
        mutex_lock(&queue.ready, SOURCE, "enqueue").push_back(Stored { seq, envelope });
        queue.notify.notify_one();

        self.emit(BrokerEvent::Enqueued {
            queue: queue.decl.name.clone(),
            message_id,
            routing_key: routing_key.to_string(),
        });

        if let Some(ttl) = queue.decl.message_ttl {
            let inner = Arc::clone(self);
            let queue = Arc::clone(queue);
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                inner.expire(&queue, seq);
            });
        }
    }

    fn expire(self: &Arc<Self>, queue: &Arc<QueueState>, seq: u64) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let expired = {
            let mut ready = mutex_lock(&queue.ready, SOURCE, "expire");
            let position = ready.iter().position(|stored| stored.seq == seq);
            position.and_then(|index| ready.remove(index))
        };

        if let Some(stored) = expired {
            self.emit(BrokerEvent::Expired {
                queue: queue.decl.name.clone(),
                message_id: stored.envelope.message_id.clone(),
            });
            self.dead_letter(queue, stored.envelope, DeathReason::Expired);
        }
    }

    fn dead_letter(
        self: &Arc<Self>,
        queue: &Arc<QueueState>,
        mut envelope: Envelope,
        reason: DeathReason,
    ) {
        let Some(exchange) = queue.decl.dead_letter_exchange.clone() else {
            debug!(
                target = "vhub::broker::memory",
                queue = %queue.decl.name,
                message_id = %envelope.message_id,
                reason = reason.as_str(),
                "Discarded message from queue without dead-letter exchange"
            );
            self.emit(BrokerEvent::Discarded {
                queue: queue.decl.name.clone(),
                message_id: envelope.message_id,
            });
            return;
        };

        envelope.record_death(&queue.decl.name, reason, OffsetDateTime::now_utc());
        let routing_key = queue
            .decl
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| envelope.routing_key.clone());

        match self.resolve(&exchange, &routing_key) {
            Ok(targets) if !targets.is_empty() => {
                debug!(
                    target = "vhub::broker::memory",
                    from = %queue.decl.name,
                    exchange = %exchange,
                    routing_key = %routing_key,
                    message_id = %envelope.message_id,
                    reason = reason.as_str(),
                    "Dead-lettered message"
                );
                for target in targets {
                    self.enqueue(&target, envelope.clone(), &exchange, &routing_key);
                }
            }
            _ => {
                warn!(
                    target = "vhub::broker::memory",
                    from = %queue.decl.name,
                    exchange = %exchange,
                    routing_key = %routing_key,
                    message_id = %envelope.message_id,
                    "Dead-letter target matched no queue; message discarded"
                );
                self.emit(BrokerEvent::Discarded {
                    queue: queue.decl.name.clone(),
                    message_id: envelope.message_id,
                });
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        for exchange in topology.exchanges() {
            self.inner.exchanges.entry(exchange.name.clone()).or_default();
        }

        for queue in topology.queues() {
            if let Some(existing) = self.inner.queue(&queue.name) {
                if existing.decl != *queue {
                    return Err(BrokerError::transport(format!(
                        "queue `{}` already declared with different arguments",
                        queue.name
                    )));
                }
                continue;
            }
            self.inner.queues.insert(
                queue.name.clone(),
                Arc::new(QueueState {
                    decl: queue.clone(),
                    ready: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                }),
            );
        }

        for binding in topology.bindings() {
            if self.inner.queue(&binding.queue).is_none() {
                return Err(BrokerError::UnknownQueue(binding.queue.clone()));
            }
            let mut bindings = self
                .inner
                .exchanges
                .get_mut(&binding.exchange)
                .ok_or_else(|| BrokerError::UnknownExchange(binding.exchange.clone()))?;
            if !bindings.contains(binding) {
                bindings.push(binding.clone());
            }
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Envelope,
    ) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let targets = self.inner.resolve(exchange, routing_key)?;
        if targets.is_empty() {
            return Err(BrokerError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        for target in targets {
            self.inner.enqueue(&target, message.clone(), exchange, routing_key);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _prefetch: u16,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let state = self
            .inner
            .queue(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            queue: state,
        }))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let state = self
            .inner
            .queue(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let depth = mutex_lock(&state.ready, SOURCE, "queue_depth").len();
        Ok(depth as u64)
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    queue: Arc<QueueState>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            let notified = self.queue.notify.notified();
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }

            let next = mutex_lock(&self.queue.ready, SOURCE, "next_delivery").pop_front();
            if let Some(stored) = next {
                let envelope = stored.envelope.clone();
                self.inner.emit(BrokerEvent::Delivered {
                    queue: self.queue.decl.name.clone(),
                    message_id: envelope.message_id.clone(),
                });
                let acker = MemoryAcker {
                    inner: Arc::clone(&self.inner),
                    queue: Arc::clone(&self.queue),
                    pending: Mutex::new(Some(stored)),
                };
                return Some(Ok(Delivery::new(envelope, Box::new(acker))));
            }

            notified.await;
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: Arc<QueueState>,
    pending: Mutex<Option<Stored>>,
}

impl MemoryAcker {
    fn take(&self) -> Result<Stored, BrokerError> {
        mutex_lock(&self.pending, SOURCE, "settle")
            .take()
            .ok_or_else(|| BrokerError::transport("delivery already settled"))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let stored = self.take()?;
        self.inner.emit(BrokerEvent::Acked {
            queue: self.queue.decl.name.clone(),
            message_id: stored.envelope.message_id,
        });
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        let stored = self.take()?;
        self.inner.emit(BrokerEvent::Rejected {
            queue: self.queue.decl.name.clone(),
            message_id: stored.envelope.message_id.clone(),
        });
        self.inner.dead_letter(&self.queue, stored.envelope, DeathReason::Rejected);
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        let pending = self
            .pending
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(mut stored) = pending {
            stored.envelope.redelivered = true;
            let message_id = stored.envelope.message_id.clone();
            mutex_lock(&self.queue.ready, SOURCE, "requeue").push_front(stored);
            self.queue.notify.notify_one();
            self.inner.emit(BrokerEvent::Requeued {
                queue: self.queue.decl.name.clone(),
                message_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::config::BrokerSettings;
    use crate::domain::commands::CommandKind;

    async fn declared() -> (MemoryBroker, Topology) {
        let broker = MemoryBroker::new();
        let topology = Topology::build(&BrokerSettings::default());
        broker.declare(&topology).await.expect("declare");
        (broker, topology)
    }

    fn message(body: &'static str) -> Envelope {
        Envelope::json(Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn publish_routes_by_key_and_delivers_in_order() {
        let (broker, topology) = declared().await;
        let route = topology.route(CommandKind::Create);

        broker
            .publish(&route.exchange, &route.routing_key, message("1"))
            .await
            .expect("publish");
        broker
            .publish(&route.exchange, &route.routing_key, message("2"))
            .await
            .expect("publish");
        assert_eq!(broker.queue_depth(&route.queue).await.expect("depth"), 2);

        let mut subscription = broker.subscribe(&route.queue, 1).await.expect("subscribe");
        let first = subscription.next_delivery().await.expect("open").expect("delivery");
        assert_eq!(first.envelope().payload, Bytes::from_static(b"1"));
        assert_eq!(first.envelope().routing_key, route.routing_key);
        first.ack().await.expect("ack");
        assert_eq!(broker.queue_depth(&route.queue).await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn unroutable_and_unknown_targets_are_errors() {
        let (broker, topology) = declared().await;
        let route = topology.route(CommandKind::Create);

        let err = broker
            .publish(&route.exchange, "no.such.key", message("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unroutable { .. }));

        let err = broker
            .publish("missing.exchange", &route.routing_key, message("x"))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::UnknownExchange("missing.exchange".into()));
        assert!(broker.subscribe("missing.queue", 1).await.is_err());
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let (broker, topology) = declared().await;
        broker.declare(&topology).await.expect("second declare");
        let route = topology.route(CommandKind::Delete);
        broker
            .publish(&route.exchange, &route.routing_key, message("x"))
            .await
            .expect("publish");
        assert_eq!(broker.queue_depth(&route.queue).await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn dropped_delivery_is_requeued_as_redelivered() {
        let (broker, topology) = declared().await;
        let route = topology.route(CommandKind::Create);
        broker
            .publish(&route.exchange, &route.routing_key, message("x"))
            .await
            .expect("publish");

        let mut subscription = broker.subscribe(&route.queue, 1).await.expect("subscribe");
        let delivery = subscription.next_delivery().await.expect("open").expect("delivery");
        assert!(!delivery.envelope().redelivered);
        drop(delivery);

        let again = subscription.next_delivery().await.expect("open").expect("delivery");
        assert!(again.envelope().redelivered);
        again.ack().await.expect("ack");
    }

    #[tokio::test(start_paused = true)]
    async fn reject_moves_message_into_first_tier_and_expiry_escalates() {
        let (broker, topology) = declared().await;
        let route = topology.route(CommandKind::Create).clone();
        broker
            .publish(&route.exchange, &route.routing_key, message("x"))
            .await
            .expect("publish");

        let mut subscription = broker.subscribe(&route.queue, 1).await.expect("subscribe");
        let delivery = subscription.next_delivery().await.expect("open").expect("delivery");
        delivery.reject().await.expect("reject");

        let parked = broker.ready_messages(&route.tiers[0].queue);
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].rejections_from(&route.queue), 1);
        assert_eq!(parked[0].routing_key, "retry-tier-1");

        tokio::time::sleep(Duration::from_secs(5) + Duration::from_millis(1)).await;
        assert!(broker.ready_messages(&route.tiers[0].queue).is_empty());
        assert_eq!(broker.ready_messages(&route.tiers[1].queue).len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let back = subscription.next_delivery().await.expect("open").expect("delivery");
        assert_eq!(back.envelope().routing_key, route.routing_key);
        assert_eq!(back.envelope().rejections_from(&route.queue), 1);
        assert_eq!(
            back.envelope()
                .deaths_in(&route.tiers[1].queue, DeathReason::Expired),
            1
        );
        back.ack().await.expect("ack");
    }

    #[tokio::test]
    async fn rejecting_from_queue_without_target_discards() {
        let (broker, topology) = declared().await;
        let mut events = broker.subscribe_events();
        let route = topology.route(CommandKind::Create);
        broker
            .publish(&route.terminal_exchange, &route.terminal_routing_key, message("x"))
            .await
            .expect("publish");

        let mut subscription = broker
            .subscribe(topology.terminal_queue(), 1)
            .await
            .expect("subscribe");
        let delivery = subscription.next_delivery().await.expect("open").expect("delivery");
        let message_id = delivery.envelope().message_id.clone();
        delivery.reject().await.expect("reject");

        let mut discarded = false;
        while let Ok(event) = events.try_recv() {
            if event
                == (BrokerEvent::Discarded {
                    queue: topology.terminal_queue().to_string(),
                    message_id: message_id.clone(),
                })
            {
                discarded = true;
            }
        }
        assert!(discarded);
        assert_eq!(broker.queue_depth(topology.terminal_queue()).await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let (broker, topology) = declared().await;
        let route = topology.route(CommandKind::Create);
        let mut subscription = broker.subscribe(&route.queue, 1).await.expect("subscribe");

        let waiter = tokio::spawn(async move { subscription.next_delivery().await.is_none() });
        tokio::task::yield_now().await;
        broker.close();

        assert!(waiter.await.expect("join"));
        assert_eq!(
            broker
                .publish(&route.exchange, &route.routing_key, message("x"))
                .await
                .unwrap_err(),
            BrokerError::Closed
        );
    }
}
