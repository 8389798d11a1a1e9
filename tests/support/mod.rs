//! Shared wiring for the in-process pipeline tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use vhub::application::consumer::RequestConsumer;
use vhub::application::dispatch::RetryPolicy;
use vhub::application::producer::RequestProducer;
use vhub::application::queries::QueryService;
use vhub::application::review::ReviewService;
use vhub::application::workers::spawn_workers;
use vhub::broker::{Broker, BrokerEvent, MemoryBroker, Topology};
use vhub::cache::{CacheConfig, CacheEvictor, CacheStore, MemoryCacheStore, ReadThroughCache};
use vhub::config::{BrokerSettings, ProducerSettings, WorkersSettings};
use vhub::domain::identity::VolunteerIdentity;
use vhub::infra::memory::MemoryStore;

pub const ORG: &str = "org@example.com";
pub const POST_ID: i64 = 42;
pub const CREATE_QUEUE: &str = "volunteer.request.queue";
pub const DELETE_QUEUE: &str = "volunteer.request.delete.queue";
pub const DLQ: &str = "volunteer.request.dlq";

/// Upper bound for waiting on broker activity; virtual under a paused clock.
const WAIT_LIMIT: Duration = Duration::from_secs(600);

pub struct Pipeline {
    pub broker: MemoryBroker,
    pub topology: Topology,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCacheStore>,
    pub producer: RequestProducer,
    pub review: ReviewService,
    pub queries: QueryService,
    pub events: broadcast::Receiver<BrokerEvent>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Post 42 with three slots owned by [`ORG`], workers running.
    pub async fn start() -> Self {
        let broker = MemoryBroker::new();
        let topology = Topology::build(&BrokerSettings::default());
        broker.declare(&topology).await.expect("declare topology");

        let store = Arc::new(MemoryStore::new());
        store.seed_post(POST_ID, "Food bank shift", ORG, 3);

        let cache_config = CacheConfig::default();
        let cache = Arc::new(MemoryCacheStore::new(&cache_config));
        let cache_dyn: Arc<dyn CacheStore> = cache.clone();
        let evictor = CacheEvictor::new(Arc::clone(&cache_dyn), true);

        let consumer = Arc::new(RequestConsumer::new(store.clone(), evictor.clone()));
        let producer = RequestProducer::new(
            Arc::new(broker.clone()),
            store.clone(),
            &topology,
            ProducerSettings {
                precheck_post: false,
                ..ProducerSettings::default()
            },
        );
        let review = ReviewService::new(store.clone(), evictor);
        let queries = QueryService::new(
            store.clone(),
            ReadThroughCache::new(cache_dyn, cache_config),
        );

        let events = broker.subscribe_events();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = spawn_workers(
            Arc::new(broker.clone()),
            &topology,
            consumer,
            &WorkersSettings::default(),
            RetryPolicy::default(),
            shutdown_rx,
        )
        .await
        .expect("spawn workers");

        Self {
            broker,
            topology,
            store,
            cache,
            producer,
            review,
            queries,
            events,
            shutdown,
            workers,
        }
    }

    pub fn volunteer(&self, email: &str) -> VolunteerIdentity {
        self.store
            .seed_volunteer(email, "Volunteer")
            .expect("seed volunteer")
    }

    /// Waits for the next event matching `predicate`, skipping the others.
    pub async fn wait_for(&mut self, predicate: impl Fn(&BrokerEvent) -> bool) -> BrokerEvent {
        let events = &mut self.events;
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("broker event stream closed")
                    }
                }
            }
        })
        .await
        .expect("expected broker event did not arrive")
    }

    pub async fn wait_acked(&mut self, queue: &str, message_id: &str) {
        self.wait_for(|event| {
            matches!(
                event,
                BrokerEvent::Acked { queue: q, message_id: id } if q == queue && id == message_id
            )
        })
        .await;
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            worker.await.expect("worker task");
        }
    }
}
