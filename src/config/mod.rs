//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{
    BrokerOverride, CliArgs, Command, DatabaseOverride, MigrateArgs, ServeArgs, ServeOverrides,
    TopologyArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "vhub";
const ENV_PREFIX: &str = "VHUB";

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;

const DEFAULT_EXCHANGE: &str = "volunteer.request.exchange";
const DEFAULT_CREATE_ROUTING_KEY: &str = "volunteer.request.create";
const DEFAULT_CREATE_QUEUE: &str = "volunteer.request.queue";
const DEFAULT_DELETE_ROUTING_KEY: &str = "volunteer.request.delete";
const DEFAULT_DELETE_QUEUE: &str = "volunteer.request.delete.queue";
const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "volunteer.request.dlx";
const DEFAULT_DEAD_LETTER_QUEUE: &str = "volunteer.request.dlq";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

const DEFAULT_RETRY_TIER_TTLS_MS: [u64; 2] = [5_000, 30_000];
const MAX_RETRY_TIERS: u64 = 8;
const DEFAULT_MAX_ATTEMPTS: u32 = 2;

const DEFAULT_CREATE_CONCURRENCY: u32 = 4;
const DEFAULT_DELETE_CONCURRENCY: u32 = 2;
const MAX_WORKER_CONCURRENCY: u32 = 32;
const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 15;

const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 30;

const DEFAULT_CACHE_CAPACITY: usize = 1_024;
const DEFAULT_POST_BY_ID_TTL_SECS: u64 = 300;
const DEFAULT_POSTS_OF_ORG_TTL_SECS: u64 = 45;
const DEFAULT_REQUESTS_OF_VOLUNTEER_TTL_SECS: u64 = 45;
const DEFAULT_POSTS_TTL_SECS: u64 = 60;
const DEFAULT_HOME_TOP_TTL_SECS: u64 = 60;

const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 30;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub broker: BrokerSettings,
    pub retry: RetrySettings,
    pub workers: WorkersSettings,
    pub producer: ProducerSettings,
    pub cache: CacheSettings,
    pub monitor: MonitorSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    /// In-process broker; state is lost on exit.
    Memory,
    /// RabbitMQ over AMQP 0-9-1.
    Amqp,
}

impl FromStr for BrokerBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BrokerBackend::Memory),
            "amqp" | "rabbitmq" => Ok(BrokerBackend::Amqp),
            other => Err(format!("unknown broker backend `{other}`")),
        }
    }
}

/// Routing names of one command kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSettings {
    pub routing_key: String,
    pub queue: String,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub backend: BrokerBackend,
    pub url: Option<String>,
    pub connect_timeout: Duration,
    pub exchange: String,
    pub create: RouteSettings,
    pub delete: RouteSettings,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    /// TTL of each retry tier, in escalation order.
    pub retry_tiers: Vec<Duration>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            url: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            exchange: DEFAULT_EXCHANGE.to_string(),
            create: RouteSettings {
                routing_key: DEFAULT_CREATE_ROUTING_KEY.to_string(),
                queue: DEFAULT_CREATE_QUEUE.to_string(),
            },
            delete: RouteSettings {
                routing_key: DEFAULT_DELETE_ROUTING_KEY.to_string(),
                queue: DEFAULT_DELETE_QUEUE.to_string(),
            },
            dead_letter_exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_queue: DEFAULT_DEAD_LETTER_QUEUE.to_string(),
            retry_tiers: DEFAULT_RETRY_TIER_TTLS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    /// Processing attempts on the primary queue before a message is dead-lettered.
    pub max_attempts: NonZeroU32,
    pub quarantine_malformed: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::new(DEFAULT_MAX_ATTEMPTS).unwrap_or(NonZeroU32::MIN),
            quarantine_malformed: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkersSettings {
    pub create_concurrency: NonZeroU32,
    pub delete_concurrency: NonZeroU32,
    pub handler_timeout: Duration,
}

impl Default for WorkersSettings {
    fn default() -> Self {
        Self {
            create_concurrency: NonZeroU32::new(DEFAULT_CREATE_CONCURRENCY)
                .unwrap_or(NonZeroU32::MIN),
            delete_concurrency: NonZeroU32::new(DEFAULT_DELETE_CONCURRENCY)
                .unwrap_or(NonZeroU32::MIN),
            handler_timeout: Duration::from_secs(DEFAULT_HANDLER_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProducerSettings {
    pub precheck_post: bool,
    pub publish_timeout: Duration,
    pub failure_threshold: NonZeroU32,
    pub open_cooldown: Duration,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            precheck_post: true,
            publish_timeout: Duration::from_millis(DEFAULT_PUBLISH_TIMEOUT_MS),
            failure_threshold: NonZeroU32::new(DEFAULT_BREAKER_FAILURE_THRESHOLD)
                .unwrap_or(NonZeroU32::MIN),
            open_cooldown: Duration::from_secs(DEFAULT_BREAKER_COOLDOWN_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub capacity_per_namespace: NonZeroUsize,
    pub post_by_id_ttl: Duration,
    pub posts_of_org_ttl: Duration,
    pub requests_of_volunteer_ttl: Duration,
    pub posts_ttl: Duration,
    pub home_top_ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("retry.tier_ttls_ms")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Topology(args)) => raw.apply_broker_override(&args.broker),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    broker: RawBrokerSettings,
    retry: RawRetrySettings,
    workers: RawWorkersSettings,
    producer: RawProducerSettings,
    cache: RawCacheSettings,
    monitor: RawMonitorSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_database_override(&overrides.database);
        self.apply_broker_override(&overrides.broker);

        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(value) = overrides.workers_create_concurrency {
            self.workers.create_concurrency = Some(value);
        }
        if let Some(value) = overrides.workers_delete_concurrency {
            self.workers.delete_concurrency = Some(value);
        }
        if let Some(value) = overrides.retry_max_attempts {
            self.retry.max_attempts = Some(value);
        }
        if let Some(seconds) = overrides.monitor_interval_seconds {
            self.monitor.interval_seconds = Some(seconds);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_broker_override(&mut self, overrides: &BrokerOverride) {
        if let Some(backend) = overrides.broker_backend.as_ref() {
            self.broker.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.broker_url.as_ref() {
            self.broker.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            broker,
            retry,
            workers,
            producer,
            cache,
            monitor,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let retry_tiers = build_retry_tiers(&retry)?;
        let broker = build_broker_settings(broker, retry_tiers)?;
        let retry = build_retry_settings(retry)?;
        let workers = build_workers_settings(workers)?;
        let producer = build_producer_settings(producer)?;
        let cache = build_cache_settings(cache)?;
        let monitor = build_monitor_settings(monitor)?;

        Ok(Self {
            logging,
            database,
            broker,
            retry,
            workers,
            producer,
            cache,
            monitor,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_value = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = non_zero_u32(max_value.into(), "database.max_connections")?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_broker_settings(
    broker: RawBrokerSettings,
    retry_tiers: Vec<Duration>,
) -> Result<BrokerSettings, LoadError> {
    let defaults = BrokerSettings::default();

    let backend = match broker.backend {
        Some(value) => BrokerBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("broker.backend", reason))?,
        None => defaults.backend,
    };
    let url = non_blank(broker.url);
    if backend == BrokerBackend::Amqp && url.is_none() {
        return Err(LoadError::invalid(
            "broker.url",
            "an AMQP url is required when broker.backend = \"amqp\"",
        ));
    }

    let connect_timeout_secs = broker
        .connect_timeout_seconds
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    if connect_timeout_secs == 0 {
        return Err(LoadError::invalid(
            "broker.connect_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let exchange = name_or(broker.exchange, defaults.exchange, "broker.exchange")?;
    let create = RouteSettings {
        routing_key: name_or(
            broker.create_routing_key,
            defaults.create.routing_key,
            "broker.create_routing_key",
        )?,
        queue: name_or(broker.create_queue, defaults.create.queue, "broker.create_queue")?,
    };
    let delete = RouteSettings {
        routing_key: name_or(
            broker.delete_routing_key,
            defaults.delete.routing_key,
            "broker.delete_routing_key",
        )?,
        queue: name_or(broker.delete_queue, defaults.delete.queue, "broker.delete_queue")?,
    };
    if create.routing_key == delete.routing_key {
        return Err(LoadError::invalid(
            "broker.delete_routing_key",
            "create and delete commands need distinct routing keys",
        ));
    }
    if create.queue == delete.queue {
        return Err(LoadError::invalid(
            "broker.delete_queue",
            "create and delete commands need distinct queues",
        ));
    }

    let dead_letter_exchange = name_or(
        broker.dead_letter_exchange,
        defaults.dead_letter_exchange,
        "broker.dead_letter_exchange",
    )?;
    if dead_letter_exchange == exchange {
        return Err(LoadError::invalid(
            "broker.dead_letter_exchange",
            "must differ from broker.exchange",
        ));
    }
    let dead_letter_queue = name_or(
        broker.dead_letter_queue,
        defaults.dead_letter_queue,
        "broker.dead_letter_queue",
    )?;

    Ok(BrokerSettings {
        backend,
        url,
        connect_timeout: Duration::from_secs(connect_timeout_secs),
        exchange,
        create,
        delete,
        dead_letter_exchange,
        dead_letter_queue,
        retry_tiers,
    })
}

/// Tier TTLs come from an explicit list, or from `base_ttl_ms` scaled by
/// `multiplier` for `tier_count` tiers.
fn build_retry_tiers(retry: &RawRetrySettings) -> Result<Vec<Duration>, LoadError> {
    let millis: Vec<u64> = match (&retry.tier_ttls_ms, retry.base_ttl_ms) {
        (Some(list), _) => list.clone(),
        (None, Some(base)) => {
            let multiplier = retry.multiplier.unwrap_or(1.0);
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(LoadError::invalid(
                    "retry.multiplier",
                    "must be a finite value of at least 1.0",
                ));
            }
            let count = retry.tier_count.unwrap_or(DEFAULT_RETRY_TIER_TTLS_MS.len() as u64);
            let mut current = base as f64;
            let mut tiers = Vec::new();
            for _ in 0..count.min(MAX_RETRY_TIERS + 1) {
                tiers.push(current.round() as u64);
                current *= multiplier;
            }
            tiers
        }
        (None, None) => DEFAULT_RETRY_TIER_TTLS_MS.to_vec(),
    };

    if millis.is_empty() {
        return Err(LoadError::invalid(
            "retry.tier_ttls_ms",
            "at least one retry tier is required",
        ));
    }
    if millis.len() as u64 > MAX_RETRY_TIERS {
        return Err(LoadError::invalid(
            "retry.tier_ttls_ms",
            format!("at most {MAX_RETRY_TIERS} retry tiers are supported"),
        ));
    }
    if millis.iter().any(|ms| *ms == 0) {
        return Err(LoadError::invalid(
            "retry.tier_ttls_ms",
            "tier TTLs must be greater than zero",
        ));
    }
    if millis.iter().any(|ms| *ms > u64::from(u32::MAX)) {
        return Err(LoadError::invalid(
            "retry.tier_ttls_ms",
            "tier TTLs must fit the broker's 32-bit message-ttl",
        ));
    }

    Ok(millis.into_iter().map(Duration::from_millis).collect())
}

fn build_retry_settings(retry: RawRetrySettings) -> Result<RetrySettings, LoadError> {
    let max_attempts = non_zero_u32(
        retry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).into(),
        "retry.max_attempts",
    )?;

    Ok(RetrySettings {
        max_attempts,
        quarantine_malformed: retry.quarantine_malformed.unwrap_or(false),
    })
}

fn build_workers_settings(workers: RawWorkersSettings) -> Result<WorkersSettings, LoadError> {
    let create_concurrency = clamped_concurrency(
        workers
            .create_concurrency
            .unwrap_or(DEFAULT_CREATE_CONCURRENCY),
    );
    let delete_concurrency = clamped_concurrency(
        workers
            .delete_concurrency
            .unwrap_or(DEFAULT_DELETE_CONCURRENCY),
    );

    let timeout_secs = workers
        .handler_timeout_seconds
        .unwrap_or(DEFAULT_HANDLER_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "workers.handler_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(WorkersSettings {
        create_concurrency,
        delete_concurrency,
        handler_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_producer_settings(producer: RawProducerSettings) -> Result<ProducerSettings, LoadError> {
    let publish_timeout_ms = producer
        .publish_timeout_ms
        .unwrap_or(DEFAULT_PUBLISH_TIMEOUT_MS);
    if publish_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "producer.publish_timeout_ms",
            "must be greater than zero",
        ));
    }

    let failure_threshold = non_zero_u32(
        producer
            .failure_threshold
            .unwrap_or(DEFAULT_BREAKER_FAILURE_THRESHOLD)
            .into(),
        "producer.failure_threshold",
    )?;

    let cooldown_secs = producer
        .open_cooldown_seconds
        .unwrap_or(DEFAULT_BREAKER_COOLDOWN_SECS);
    if cooldown_secs == 0 {
        return Err(LoadError::invalid(
            "producer.open_cooldown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ProducerSettings {
        precheck_post: producer.precheck_post.unwrap_or(true),
        publish_timeout: Duration::from_millis(publish_timeout_ms),
        failure_threshold,
        open_cooldown: Duration::from_secs(cooldown_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let capacity = cache.capacity_per_namespace.unwrap_or(DEFAULT_CACHE_CAPACITY);
    let capacity_per_namespace = NonZeroUsize::new(capacity).ok_or_else(|| {
        LoadError::invalid("cache.capacity_per_namespace", "must be greater than zero")
    })?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        capacity_per_namespace,
        post_by_id_ttl: ttl_seconds(
            cache.post_by_id_ttl_seconds,
            DEFAULT_POST_BY_ID_TTL_SECS,
            "cache.post_by_id_ttl_seconds",
        )?,
        posts_of_org_ttl: ttl_seconds(
            cache.posts_of_org_ttl_seconds,
            DEFAULT_POSTS_OF_ORG_TTL_SECS,
            "cache.posts_of_org_ttl_seconds",
        )?,
        requests_of_volunteer_ttl: ttl_seconds(
            cache.requests_of_volunteer_ttl_seconds,
            DEFAULT_REQUESTS_OF_VOLUNTEER_TTL_SECS,
            "cache.requests_of_volunteer_ttl_seconds",
        )?,
        posts_ttl: ttl_seconds(
            cache.posts_ttl_seconds,
            DEFAULT_POSTS_TTL_SECS,
            "cache.posts_ttl_seconds",
        )?,
        home_top_ttl: ttl_seconds(
            cache.home_top_ttl_seconds,
            DEFAULT_HOME_TOP_TTL_SECS,
            "cache.home_top_ttl_seconds",
        )?,
    })
}

fn build_monitor_settings(monitor: RawMonitorSettings) -> Result<MonitorSettings, LoadError> {
    let interval_seconds = monitor
        .interval_seconds
        .unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS);
    if interval_seconds == 0 {
        return Err(LoadError::invalid(
            "monitor.interval_seconds",
            "must be greater than zero",
        ));
    }

    Ok(MonitorSettings {
        interval: Duration::from_secs(interval_seconds),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBrokerSettings {
    backend: Option<String>,
    url: Option<String>,
    connect_timeout_seconds: Option<u64>,
    exchange: Option<String>,
    create_routing_key: Option<String>,
    create_queue: Option<String>,
    delete_routing_key: Option<String>,
    delete_queue: Option<String>,
    dead_letter_exchange: Option<String>,
    dead_letter_queue: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetrySettings {
    tier_ttls_ms: Option<Vec<u64>>,
    base_ttl_ms: Option<u64>,
    multiplier: Option<f64>,
    tier_count: Option<u64>,
    max_attempts: Option<u32>,
    quarantine_malformed: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkersSettings {
    create_concurrency: Option<u32>,
    delete_concurrency: Option<u32>,
    handler_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProducerSettings {
    precheck_post: Option<bool>,
    publish_timeout_ms: Option<u64>,
    failure_threshold: Option<u32>,
    open_cooldown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    capacity_per_namespace: Option<usize>,
    post_by_id_ttl_seconds: Option<u64>,
    posts_of_org_ttl_seconds: Option<u64>,
    requests_of_volunteer_ttl_seconds: Option<u64>,
    posts_ttl_seconds: Option<u64>,
    home_top_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMonitorSettings {
    interval_seconds: Option<u64>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn name_or(value: Option<String>, default: String, key: &'static str) -> Result<String, LoadError> {
    match value {
        None => Ok(default),
        Some(value) => non_blank(Some(value))
            .ok_or_else(|| LoadError::invalid(key, "name must not be blank")),
    }
}

fn ttl_seconds(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    let seconds = value.unwrap_or(default);
    if seconds == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(seconds))
}

fn clamped_concurrency(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value.clamp(1, MAX_WORKER_CONCURRENCY)).unwrap_or(NonZeroU32::MIN)
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
