//! Long-running consumer workers and the dead-letter monitor.
//!
//! Each worker owns one subscription with prefetch 1 and carries a delivery
//! through handling and settlement before asking for the next one. Shutdown
//! is observed only between deliveries.

use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::consumer::{CommandHandler, MessageHandler, RequestConsumer};
use super::dispatch::{Dispatcher, RetryPolicy, Settlement};
use super::middleware::{Instrumented, TimeLimited};
use crate::broker::{Broker, BrokerError, Subscription, Topology};
use crate::config::WorkersSettings;
use crate::domain::commands::CommandKind;

const METRIC_DLQ_DEPTH: &str = "vhub_dead_letter_queue_depth";
const PREFETCH: u16 = 1;

/// Runs until the subscription ends or `shutdown` flips to `true`.
pub async fn run_worker(
    worker_id: usize,
    handler: Arc<dyn MessageHandler>,
    dispatcher: Arc<Dispatcher>,
    mut subscription: Box<dyn Subscription>,
    mut shutdown: watch::Receiver<bool>,
) {
    let kind = handler.kind().as_str();
    info!(
        target = "vhub::application::workers",
        worker_id,
        kind,
        queue = %dispatcher.route().queue,
        "Worker started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = subscription.next_delivery() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                error!(
                    target = "vhub::application::workers",
                    worker_id,
                    kind,
                    error = %err,
                    "Subscription failed"
                );
                break;
            }
            None => {
                info!(
                    target = "vhub::application::workers",
                    worker_id,
                    kind,
                    "Subscription closed"
                );
                break;
            }
        };

        let outcome = handler.handle(delivery.envelope()).await;
        match dispatcher.settle(delivery, &outcome).await {
            Ok(Settlement::Rejected { attempt }) => info!(
                target = "vhub::application::workers",
                worker_id,
                kind,
                attempt,
                "Delivery rejected into retry chain"
            ),
            Ok(_) => {}
            Err(err) => warn!(
                target = "vhub::application::workers",
                worker_id,
                kind,
                error = %err,
                "Delivery settlement failed; broker will redeliver"
            ),
        }
    }

    info!(
        target = "vhub::application::workers",
        worker_id,
        kind,
        "Worker stopped"
    );
}

fn concurrency_for(settings: &WorkersSettings, kind: CommandKind) -> usize {
    let configured = match kind {
        CommandKind::Create => settings.create_concurrency,
        CommandKind::Delete => settings.delete_concurrency,
    };
    configured.get() as usize
}

/// Subscribes and spawns the configured number of workers per command kind.
pub async fn spawn_workers(
    broker: Arc<dyn Broker>,
    topology: &Topology,
    consumer: Arc<RequestConsumer>,
    settings: &WorkersSettings,
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, BrokerError> {
    let mut handles = Vec::new();

    for kind in CommandKind::ALL {
        let route = topology.route(kind);
        let handler: Arc<dyn MessageHandler> = Arc::new(Instrumented::new(
            TimeLimited::new(
                CommandHandler::new(Arc::clone(&consumer), kind),
                settings.handler_timeout,
            ),
            route.queue.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&broker),
            route.clone(),
            policy,
        ));

        for _ in 0..concurrency_for(settings, kind) {
            let subscription = broker.subscribe(&route.queue, PREFETCH).await?;
            let worker_id = handles.len();
            handles.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&handler),
                Arc::clone(&dispatcher),
                subscription,
                shutdown.clone(),
            )));
        }
    }

    Ok(handles)
}

/// How a supervised worker pool came to a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkersExit {
    /// Shutdown was requested and every worker drained.
    Shutdown,
    /// Every worker ended on its own, usually because the broker went away.
    SubscriptionsLost,
}

/// Waits for `signal` or for every worker to exit, whichever comes first.
/// Shutdown is broadcast in both cases; after `signal` the workers are
/// awaited until they drain.
pub async fn supervise_workers<S>(
    workers: Vec<JoinHandle<()>>,
    signal: S,
    shutdown: &watch::Sender<bool>,
) -> WorkersExit
where
    S: Future<Output = ()>,
{
    let count = workers.len();
    let all_exited = join_workers(workers);
    tokio::pin!(all_exited);

    let exit = tokio::select! {
        _ = &mut all_exited => WorkersExit::SubscriptionsLost,
        _ = signal => WorkersExit::Shutdown,
    };

    // Receivers only disappear once every task has already exited.
    let _ = shutdown.send(true);

    match exit {
        WorkersExit::Shutdown => {
            all_exited.await;
            info!(
                target = "vhub::application::workers",
                workers = count,
                "Workers drained"
            );
        }
        WorkersExit::SubscriptionsLost => error!(
            target = "vhub::application::workers",
            workers = count,
            "Every worker stopped without a shutdown request; nothing is consuming"
        ),
    }
    exit
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        if let Err(err) = worker.await {
            warn!(
                target = "vhub::application::workers",
                error = %err,
                "Worker task aborted"
            );
        }
    }
}

/// Samples the terminal queue depth once.
pub async fn check_dead_letters(broker: &dyn Broker, queue: &str) -> Result<u64, BrokerError> {
    let depth = broker.queue_depth(queue).await?;
    gauge!(METRIC_DLQ_DEPTH, "queue" => queue.to_string()).set(depth as f64);
    if depth > 0 {
        error!(
            target = "vhub::application::workers",
            queue,
            depth,
            "Dead-letter queue holds messages that need attention"
        );
    }
    Ok(depth)
}

pub async fn monitor_dead_letters(
    broker: Arc<dyn Broker>,
    queue: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = check_dead_letters(broker.as_ref(), &queue).await {
                    warn!(
                        target = "vhub::application::workers",
                        queue = %queue,
                        error = %err,
                        "Dead-letter queue depth unavailable"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::broker::{Envelope, MemoryBroker};
    use crate::cache::{CacheConfig, CacheEvictor, MemoryCacheStore};
    use crate::config::BrokerSettings;
    use crate::domain::commands::DeleteRequestCommand;
    use crate::domain::types::RequestStatus;
    use crate::infra::memory::MemoryStore;

    #[tokio::test]
    async fn workers_drain_queue_and_stop_on_shutdown() {
        let broker = MemoryBroker::new();
        let topology = Topology::build(&BrokerSettings::default());
        broker.declare(&topology).await.expect("declare");

        let store = Arc::new(MemoryStore::new());
        store.seed_post(42, "Beach cleanup", "org@example.com", 3);
        store.seed_volunteer("alice@example.com", "Alice").expect("seed volunteer");
        let request_id = store
            .seed_request(42, "alice@example.com", RequestStatus::Accepted)
            .expect("seed request");
        let cache = Arc::new(MemoryCacheStore::new(&CacheConfig::default()));
        let consumer = Arc::new(RequestConsumer::new(
            store.clone(),
            CacheEvictor::new(cache, true),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = spawn_workers(
            Arc::new(broker.clone()),
            &topology,
            consumer,
            &WorkersSettings::default(),
            RetryPolicy::default(),
            shutdown_rx,
        )
        .await
        .expect("spawn");
        assert_eq!(handles.len(), 4 + 2);

        let mut events = broker.subscribe_events();
        let payload = DeleteRequestCommand::new(request_id, time::OffsetDateTime::now_utc())
            .expect("command")
            .encode()
            .expect("encode");
        let route = topology.route(CommandKind::Delete);
        broker
            .publish(&route.exchange, &route.routing_key, Envelope::json(payload))
            .await
            .expect("publish");

        loop {
            let event = events.recv().await.expect("event");
            if matches!(event, crate::broker::BrokerEvent::Acked { .. }) {
                break;
            }
        }
        assert_eq!(store.request_count(), 0);
        assert_eq!(store.slots_of(42), Some(4));

        shutdown_tx.send(true).expect("shutdown");
        for handle in handles {
            handle.await.expect("worker exits");
        }
    }

    async fn running_pool(
        broker: &MemoryBroker,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let topology = Topology::build(&BrokerSettings::default());
        broker.declare(&topology).await.expect("declare");
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCacheStore::new(&CacheConfig::default()));
        let consumer = Arc::new(RequestConsumer::new(store, CacheEvictor::new(cache, true)));
        spawn_workers(
            Arc::new(broker.clone()),
            &topology,
            consumer,
            &WorkersSettings::default(),
            RetryPolicy::default(),
            shutdown,
        )
        .await
        .expect("spawn")
    }

    #[tokio::test]
    async fn supervisor_reports_workers_lost_with_the_broker() {
        let broker = MemoryBroker::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = running_pool(&broker, shutdown_rx.clone()).await;
        tokio::task::yield_now().await;

        broker.close();
        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            supervise_workers(handles, std::future::pending(), &shutdown_tx),
        )
        .await
        .expect("workers end once the broker closes");

        assert_eq!(exit, WorkersExit::SubscriptionsLost);
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn supervisor_drains_workers_on_signal() {
        let broker = MemoryBroker::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = running_pool(&broker, shutdown_rx).await;

        let exit = supervise_workers(handles, std::future::ready(()), &shutdown_tx).await;
        assert_eq!(exit, WorkersExit::Shutdown);
        assert!(!broker.is_closed());
    }

    #[tokio::test]
    async fn dead_letter_depth_is_sampled() {
        let broker = MemoryBroker::new();
        let topology = Topology::build(&BrokerSettings::default());
        broker.declare(&topology).await.expect("declare");

        let dlq = topology.terminal_queue().to_string();
        assert_eq!(check_dead_letters(&broker, &dlq).await.expect("depth"), 0);

        let route = topology.route(CommandKind::Create);
        broker
            .publish(
                &route.terminal_exchange,
                &route.terminal_routing_key,
                Envelope::json(Bytes::from_static(b"{}")),
            )
            .await
            .expect("publish");
        assert_eq!(check_dead_letters(&broker, &dlq).await.expect("depth"), 1);
    }
}
