// src/tunnel/mod.rs
//! User-space TCP termination
//!
//! Every TCP flow an application opens through the virtual interface is
//! terminated here and re-originated as an ordinary socket to the real
//! destination.
//!
//! ```text
//!              ingress                 flow input
//!  device ──► [Packet queue] ──► Dispatcher ──► [per-flow queue] ──► UpstreamWorker ──► socket
//!                                    ▲                                   │    (TCB)
//!                                    │ close notices                     ▼
//!  device ◄── [frame queue] ◄─────────────────────────────────── DownstreamWorker ◄── socket
//!              egress
//! ```
//!
//! The dispatcher is the only owner of the flow registry. Workers report a
//! finished flow through the close-notice queue and the dispatcher evicts it
//! before handling its next packet.

pub mod close;
pub mod dispatcher;
pub mod downstream;
pub mod protect;
pub mod stats;
pub mod tcb;
pub mod upstream;

pub use dispatcher::Dispatcher;
pub use protect::{FwmarkProtector, NoopProtector, SocketProtector};
pub use stats::{StatsSnapshot, TunnelStats};
pub use tcb::{FlowKey, Tcb, TcbState, TcbStatus};

use crate::packet::{Packet, PacketCodec};
use crate::utils::config::TunnelConfig;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Queues and counters of a running tunnel
pub struct TunnelHandle {
    /// Decoded packets read from the device
    pub ingress: mpsc::Sender<Packet>,

    /// Synthetic frames to write back to the device
    pub egress: mpsc::Receiver<Bytes>,

    pub stats: Arc<TunnelStats>,

    /// Dispatcher task; finishes once every ingress sender is dropped
    pub task: JoinHandle<()>,
}

/// Create the queues and start the dispatcher
pub fn spawn(
    config: TunnelConfig,
    codec: Arc<dyn PacketCodec>,
    protector: Arc<dyn SocketProtector>,
) -> TunnelHandle {
    let (ingress, ingress_rx) = mpsc::channel(config.ingress_capacity);
    let (egress_tx, egress) = mpsc::channel(config.egress_capacity);

    let dispatcher = Dispatcher::new(config, codec, protector, egress_tx);
    let stats = dispatcher.stats_handle();
    let task = tokio::spawn(dispatcher.run(ingress_rx));

    TunnelHandle {
        ingress,
        egress,
        stats,
        task,
    }
}
