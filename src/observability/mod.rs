// src/observability/mod.rs
//! Logging and metrics setup for the engine binary

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("netcap_engine={}", config.log_level)))
        .map_err(|e| EngineError::ConfigError(format!("invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };

    installed.map_err(|e| EngineError::ConfigError(format!("tracing already initialised: {}", e)))
}

/// Start the Prometheus exporter when an address is configured.
///
/// Without one the `metrics` macros stay no-ops.
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::ConfigError(format!("metrics exporter: {}", e)))?;

    info!("Serving metrics on http://{}/metrics", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_address() {
        assert!(init_metrics(None).is_ok());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        // Only meaningful when RUST_LOG does not override the level
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = ObservabilityConfig {
            log_level: "not a level[".into(),
            ..Default::default()
        };
        assert!(init_tracing(&config).is_err());
    }
}
