use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric;
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

/// Register descriptions for every metric the cache emits. Safe to call more
/// than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            metric::METRIC_HIT,
            Unit::Count,
            "Total number of reads served from storage."
        );
        describe_counter!(
            metric::METRIC_MISS,
            Unit::Count,
            "Total number of reads that found no stored value."
        );
        describe_counter!(
            metric::METRIC_POPULATE,
            Unit::Count,
            "Total number of successful wrapped calls run to populate a key."
        );
        describe_counter!(
            metric::METRIC_POPULATE_ERROR,
            Unit::Count,
            "Total number of wrapped calls that failed or timed out."
        );
        describe_counter!(
            metric::METRIC_EVICT,
            Unit::Count,
            "Total number of names evicted directly."
        );
        describe_counter!(
            metric::METRIC_CASCADE,
            Unit::Count,
            "Total number of keys evicted through dependency tags."
        );
        describe_counter!(
            metric::METRIC_STALE_DISCARD,
            Unit::Count,
            "Total number of populated entries discarded because of a concurrent eviction."
        );
        describe_counter!(
            metric::METRIC_STORAGE_ERROR,
            Unit::Count,
            "Total number of storage failures seen by the advisor."
        );
        describe_counter!(
            metric::METRIC_STORAGE_EVICT,
            Unit::Count,
            "Total number of memory storage evictions due to capacity."
        );
        describe_histogram!(
            metric::METRIC_POPULATE_MS,
            Unit::Milliseconds,
            "Wrapped call latency during population in milliseconds."
        );
    });
}
