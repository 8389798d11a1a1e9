use std::{process, sync::Arc};

use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use vhub::{
    application::{
        consumer::RequestConsumer,
        dispatch::RetryPolicy,
        error::AppError,
        repos::SignupStore,
        workers::{WorkersExit, monitor_dead_letters, spawn_workers, supervise_workers},
    },
    broker::{Broker, BrokerError, MemoryBroker, Topology},
    cache::{CacheConfig, CacheEvictor, MemoryCacheStore},
    config::{self, BrokerBackend, BrokerSettings, DatabaseSettings},
    infra::{db::PostgresRepositories, error::InfraError, memory::MemoryStore, telemetry},
};

mod migrations_tool;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(i32::from(error.exit_code()));
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Topology(args) => run_topology(settings, args.declare).await,
        config::Command::Migrate(_) => migrations_tool::apply(&settings.database).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let broker = connect_broker(&settings.broker).await?;
    let store = init_store(&settings.database).await?;

    let topology = Topology::build(&settings.broker);
    broker.declare(&topology).await?;
    info!(
        target = "vhub::main",
        backend = ?settings.broker.backend,
        exchange = %settings.broker.exchange,
        retry_tiers = settings.broker.retry_tiers.len(),
        dead_letter_queue = %topology.terminal_queue(),
        "Broker topology declared"
    );

    let cache_config = CacheConfig::from(&settings.cache);
    let cache_store = Arc::new(MemoryCacheStore::new(&cache_config));
    let evictor = CacheEvictor::new(cache_store, cache_config.enabled);
    let consumer = Arc::new(RequestConsumer::new(Arc::clone(&store), evictor));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(
        Arc::clone(&broker),
        &topology,
        consumer,
        &settings.workers,
        RetryPolicy::from(&settings.retry),
        shutdown_rx.clone(),
    )
    .await?;
    let monitor = tokio::spawn(monitor_dead_letters(
        Arc::clone(&broker),
        topology.terminal_queue().to_string(),
        settings.monitor.interval,
        shutdown_rx,
    ));
    info!(
        target = "vhub::main",
        workers = workers.len(),
        "Request pipeline running"
    );

    let exit = supervise_workers(workers, shutdown_signal(), &shutdown_tx).await;
    if let Err(err) = monitor.await {
        warn!(target = "vhub::main", error = %err, "Monitor task aborted");
    }

    if exit == WorkersExit::SubscriptionsLost {
        return Err(BrokerError::Closed.into());
    }
    info!(target = "vhub::main", "Request pipeline stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(target = "vhub::main", "Shutdown requested; draining workers"),
        Err(err) => warn!(
            target = "vhub::main",
            error = %err,
            "Cannot listen for ctrl-c; shutting down"
        ),
    }
}

async fn run_topology(settings: config::Settings, declare: bool) -> Result<(), AppError> {
    let topology = Topology::build(&settings.broker);
    print!("{topology}");

    if declare {
        let broker = connect_broker(&settings.broker).await?;
        broker.declare(&topology).await?;
        println!("declared on {:?} broker", settings.broker.backend);
    }
    Ok(())
}

async fn connect_broker(settings: &BrokerSettings) -> Result<Arc<dyn Broker>, AppError> {
    match settings.backend {
        BrokerBackend::Memory => {
            warn!(
                target = "vhub::main",
                "Using the in-process broker; queued commands are lost on exit"
            );
            Ok(Arc::new(MemoryBroker::new()))
        }
        BrokerBackend::Amqp => connect_amqp(settings).await,
    }
}

#[cfg(feature = "amqp")]
async fn connect_amqp(settings: &BrokerSettings) -> Result<Arc<dyn Broker>, AppError> {
    let url = settings
        .url
        .as_deref()
        .ok_or_else(|| AppError::validation("broker.url is required for the amqp backend"))?;
    let broker = vhub::broker::AmqpBroker::connect(url, settings.connect_timeout).await?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "amqp"))]
async fn connect_amqp(_settings: &BrokerSettings) -> Result<Arc<dyn Broker>, AppError> {
    Err(AppError::validation(
        "the amqp broker backend requires building vhub with the `amqp` feature",
    ))
}

async fn init_store(settings: &DatabaseSettings) -> Result<Arc<dyn SignupStore>, AppError> {
    let Some(url) = settings.url.as_deref() else {
        warn!(
            target = "vhub::main",
            "No database configured; using the in-memory entity store"
        );
        return Ok(Arc::new(MemoryStore::new()));
    };

    let pool = PostgresRepositories::connect(url, settings.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::migration(err.to_string()))?;

    Ok(Arc::new(PostgresRepositories::new(pool)))
}
