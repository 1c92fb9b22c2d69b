// src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `NETCAP__SECTION__KEY` environment variables.

use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default config file name (extension resolved by the `config` crate)
const DEFAULT_CONFIG_NAME: &str = "netcap";

/// Environment variable naming an explicit config file
const CONFIG_PATH_ENV: &str = "NETCAP_CONFIG";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tunnel: TunnelConfig,
    pub device: DeviceConfig,
    pub observability: ObservabilityConfig,
}

/// Per-flow proxy settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Capacity of the device-to-proxy ingress queue
    pub ingress_capacity: usize,

    /// Capacity of the proxy-to-device egress queue
    pub egress_capacity: usize,

    /// Capacity of each flow's input queue
    pub flow_queue_capacity: usize,

    /// Outbound connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Downstream read buffer size (bytes)
    pub read_buffer_size: usize,

    /// Reset a flow after this long without packets from the device (seconds, 0 = never)
    pub idle_timeout_secs: u64,

    /// Firewall mark applied to outbound sockets so routing skips the virtual interface
    pub fwmark: Option<u32>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: 1000,
            egress_capacity: 1000,
            flow_queue_capacity: 1024,
            connect_timeout_ms: 5000,
            read_buffer_size: 4 * 1024,
            idle_timeout_secs: 300,
            fwmark: None,
        }
    }
}

impl TunnelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Virtual interface settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// File descriptor of an already configured TUN device, handed over by the host
    pub fd: Option<i32>,

    /// Largest frame read from the device in one go
    pub mtu: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            fd: None,
            mtu: 16 * 1024,
        }
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter used when RUST_LOG is unset
    pub log_level: String,

    /// Emit JSON log lines
    pub json_logs: bool,

    /// Prometheus exporter listen address (disabled when unset)
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_addr: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        let file = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => config::File::with_name(&path).required(true),
            Err(_) => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        Self::build(file)
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::build(config::File::from(path).required(true))
    }

    fn build(file: config::File<config::FileSourceFile, config::FileFormat>) -> Result<Self> {
        let config: EngineConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("NETCAP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let t = &self.tunnel;
        let checks = [
            (t.ingress_capacity, "tunnel.ingress_capacity"),
            (t.egress_capacity, "tunnel.egress_capacity"),
            (t.flow_queue_capacity, "tunnel.flow_queue_capacity"),
            (t.read_buffer_size, "tunnel.read_buffer_size"),
            (self.device.mtu, "device.mtu"),
        ];

        for (value, name) in checks {
            if value == 0 {
                return Err(EngineError::ConfigError(format!("{} must be non-zero", name)));
            }
        }

        if t.connect_timeout_ms == 0 {
            return Err(EngineError::ConfigError(
                "tunnel.connect_timeout_ms must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
