// src/lib.rs
//! netcap engine library
//!
//! Terminates TCP flows captured on a virtual network interface in user space
//! and re-originates them as ordinary sockets to their real destinations.
//!
//! # Architecture
//!
//! - **device**: frame pump between the virtual interface and the tunnel queues
//! - **packet**: IPv4/TCP packet views and the codec that builds synthetic segments
//! - **tunnel**: dispatcher, per-flow control blocks and their workers
//! - **observability**: logging and metrics setup
//! - **utils**: configuration and error types

pub mod device;
pub mod observability;
pub mod packet;
pub mod tunnel;
pub mod utils;

// Re-export commonly used types
pub use device::{DeviceBridge, TrafficStats};
#[cfg(unix)]
pub use device::TunDevice;
pub use packet::{Ipv4TcpCodec, Packet, PacketCodec, TcpFlags};
pub use tunnel::{Dispatcher, FlowKey, SocketProtector, Tcb, TunnelHandle};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
