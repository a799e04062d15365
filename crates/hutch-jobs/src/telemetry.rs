//! Log output setup for processes embedding a work queue.

#[cfg(feature = "telemetry")]
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::JobResult;
use hutch_config::TelemetryConfig;

/// Installs a global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `telemetry.log_level`. With
/// `telemetry.json` set, events are written as JSON lines.
#[cfg(feature = "telemetry")]
pub fn init_telemetry(config: &TelemetryConfig) -> JobResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.map_err(|e| crate::JobError::Internal(format!("Failed to install tracing subscriber: {e}")))?;

    tracing::info!(log_level = %config.log_level, json = config.json, "Telemetry initialized");
    Ok(())
}

/// Placeholder for when telemetry feature is disabled.
#[cfg(not(feature = "telemetry"))]
pub fn init_telemetry(_config: &TelemetryConfig) -> JobResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_with_defaults() {
        let config = TelemetryConfig::default();
        // A subscriber may already be installed by another test.
        let _ = init_telemetry(&config);
    }
}
