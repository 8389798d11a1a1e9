use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the vhub binary.
#[derive(Debug, Parser)]
#[command(
    name = "vhub",
    version,
    about = "Volunteer sign-up request pipeline worker"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "VHUB_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Declare the broker topology and run the request workers.
    Serve(Box<ServeArgs>),
    /// Print the broker topology derived from the configuration.
    Topology(TopologyArgs),
    /// Apply pending database migrations.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BrokerOverride {
    /// Override the broker backend (memory|amqp).
    #[arg(long = "broker", value_name = "BACKEND")]
    pub broker_backend: Option<String>,

    /// Override the AMQP connection URL.
    #[arg(long = "broker-url", value_name = "URL")]
    pub broker_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub broker: BrokerOverride,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the number of create-request workers.
    #[arg(long = "workers-create-concurrency", value_name = "COUNT")]
    pub workers_create_concurrency: Option<u32>,

    /// Override the number of delete-request workers.
    #[arg(long = "workers-delete-concurrency", value_name = "COUNT")]
    pub workers_delete_concurrency: Option<u32>,

    /// Override the number of processing attempts before dead-lettering.
    #[arg(long = "retry-max-attempts", value_name = "COUNT")]
    pub retry_max_attempts: Option<u32>,

    /// Override the dead-letter queue polling interval.
    #[arg(long = "monitor-interval-seconds", value_name = "SECONDS")]
    pub monitor_interval_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct TopologyArgs {
    #[command(flatten)]
    pub broker: BrokerOverride,

    /// Declare the printed topology against the configured broker.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub declare: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}
