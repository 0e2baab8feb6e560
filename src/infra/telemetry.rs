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

/// Registers units and help text for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "canopy_commit_total",
            Unit::Count,
            "Total number of generations published."
        );
        describe_counter!(
            "canopy_commit_conflict_total",
            Unit::Count,
            "Total number of commits rejected because the head moved past their base."
        );
        describe_histogram!(
            "canopy_commit_ms",
            Unit::Milliseconds,
            "Commit latency in milliseconds, planning included."
        );
        describe_counter!(
            "canopy_gc_collected_total",
            Unit::Count,
            "Total number of generations released by collection."
        );
        describe_gauge!(
            "canopy_generations_live",
            Unit::Count,
            "Generations still observable, head included."
        );
        describe_counter!(
            "canopy_pipeline_transition_total",
            Unit::Count,
            "Total number of change pipeline state transitions."
        );
        describe_counter!(
            "canopy_pipeline_outcome_total",
            Unit::Count,
            "Total number of change notifications by outcome."
        );
        describe_histogram!(
            "canopy_pipeline_apply_ms",
            Unit::Milliseconds,
            "Time to apply one change notification in milliseconds."
        );
        describe_histogram!(
            "canopy_persist_save_ms",
            Unit::Milliseconds,
            "Local cache file save latency in milliseconds."
        );
        describe_histogram!(
            "canopy_rebuild_ms",
            Unit::Milliseconds,
            "Partition rebuild latency in milliseconds."
        );
        describe_counter!(
            "canopy_seed_keys_total",
            Unit::Count,
            "Total number of seed keys selected for eager loading."
        );
    });
}
