use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "vhub_pipeline_outcome_total",
            Unit::Count,
            "Processed deliveries by command kind and outcome."
        );
        describe_histogram!(
            "vhub_pipeline_handle_ms",
            Unit::Milliseconds,
            "Delivery handling latency in milliseconds."
        );
        describe_counter!(
            "vhub_pipeline_dead_letter_total",
            Unit::Count,
            "Messages forwarded to the dead-letter queue."
        );
        describe_gauge!(
            "vhub_dead_letter_queue_depth",
            Unit::Count,
            "Ready messages in the dead-letter queue at the last sample."
        );
        describe_counter!(
            "vhub_producer_publish_total",
            Unit::Count,
            "Publish attempts by command kind and result."
        );
        describe_counter!(
            "vhub_cache_hit_total",
            Unit::Count,
            "Cache lookups served from the store."
        );
        describe_counter!(
            "vhub_cache_miss_total",
            Unit::Count,
            "Cache lookups that found no live entry."
        );
        describe_counter!(
            "vhub_cache_evict_total",
            Unit::Count,
            "Successful cache evictions by namespace."
        );
        describe_counter!(
            "vhub_cache_evict_failed_total",
            Unit::Count,
            "Cache evictions that failed and were skipped."
        );
        describe_histogram!(
            "vhub_cache_evict_ms",
            Unit::Milliseconds,
            "Latency of applying one eviction plan in milliseconds."
        );
    });
}
