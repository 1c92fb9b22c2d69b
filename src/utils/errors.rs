// src/utils/errors.rs
//! Engine error types

use std::net::SocketAddr;
use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the tunnel engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet codec error: {0}")]
    Codec(String),

    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("failed to exempt socket from capture: {0}")]
    ProtectFailed(String),

    #[error("queue full: {0}")]
    QueueFull(&'static str),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("device error: {0}")]
    DeviceError(String),
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::ConfigError(e.to_string())
    }
}

impl EngineError {
    /// Whether the error is scoped to a single flow rather than the engine
    pub fn is_flow_local(&self) -> bool {
        matches!(
            self,
            EngineError::Io(_)
                | EngineError::ConnectFailed { .. }
                | EngineError::ConnectTimeout(_)
                | EngineError::ProtectFailed(_)
                | EngineError::QueueFull(_)
                | EngineError::ChannelClosed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let addr: SocketAddr = "1.2.3.4:443".parse().unwrap();
        let err = EngineError::ConnectTimeout(addr);
        assert_eq!(err.to_string(), "connect to 1.2.3.4:443 timed out");
    }

    #[test]
    fn test_flow_local() {
        let io = EngineError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(io.is_flow_local());
        assert!(!EngineError::ConfigError("bad".into()).is_flow_local());
    }
}
