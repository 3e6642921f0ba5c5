use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;
use crate::steps::{StepKey, VersionKey};

/// Initialize structured logging. `RUST_LOG` wins over the configured level.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    tracing::info!(level = %config.log_level, json = config.json, "Telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one scheduling operation on a workflow instance
pub fn create_step_span(
    operation: &str,
    version: &VersionKey,
    process: Option<&str>,
    correlation_id: &str,
) -> tracing::Span {
    tracing::info_span!(
        "workflow_step",
        operation = operation,
        object_id = %version.object_id,
        workflow = %version.workflow,
        version = version.version,
        process = process,
        correlation.id = correlation_id,
    )
}

/// Span for an operation triggered by a single step
pub fn create_span_for_step(operation: &str, key: &StepKey, correlation_id: &str) -> tracing::Span {
    create_step_span(
        operation,
        &key.version_key(),
        Some(key.process.as_str()),
        correlation_id,
    )
}

/// Span covering a version lifecycle transition
pub fn create_lifecycle_span(operation: &str, object_id: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "version_lifecycle",
        operation = operation,
        object_id = object_id,
        correlation.id = correlation_id,
    )
}

/// Shutdown telemetry gracefully
pub fn shutdown_telemetry() {
    tracing::info!("Telemetry shutdown complete");
}
