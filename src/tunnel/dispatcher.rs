// src/tunnel/dispatcher.rs
//! Single consumer of the ingress queue
//!
//! Owns the flow registry. For every packet it first evicts flows named by
//! pending close notices, then routes the packet to its flow's input queue,
//! creating the TCB and its upstream worker on first sight of a key. Pushes
//! never block: a full flow queue drops the packet.

use crate::packet::{Packet, PacketCodec};
use crate::tunnel::close::CloseNotices;
use crate::tunnel::protect::SocketProtector;
use crate::tunnel::stats::{StatsSnapshot, TunnelStats};
use crate::tunnel::tcb::{FlowContext, FlowKey, Tcb};
use crate::tunnel::upstream::UpstreamWorker;
use crate::utils::config::TunnelConfig;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Registry entry for one live flow
struct FlowEntry {
    tcb: Arc<Tcb>,
    input: mpsc::Sender<Packet>,
}

/// Routes device packets to per-flow workers
pub struct Dispatcher {
    registry: HashMap<FlowKey, FlowEntry>,
    context: Arc<FlowContext>,
    protector: Arc<dyn SocketProtector>,
    config: Arc<TunnelConfig>,
}

impl Dispatcher {
    pub fn new(
        config: TunnelConfig,
        codec: Arc<dyn PacketCodec>,
        protector: Arc<dyn SocketProtector>,
        egress: mpsc::Sender<Bytes>,
    ) -> Self {
        let context = Arc::new(FlowContext {
            codec,
            egress,
            close_notices: Arc::new(CloseNotices::new()),
            stats: Arc::new(TunnelStats::new()),
        });

        Self {
            registry: HashMap::new(),
            context,
            protector,
            config: Arc::new(config),
        }
    }

    /// Shared counters, readable while the dispatcher runs
    pub fn stats_handle(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.context.stats)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }

    /// Consume the ingress queue until it closes
    pub async fn run(mut self, mut ingress: mpsc::Receiver<Packet>) {
        info!("Dispatcher started");

        while let Some(packet) = ingress.recv().await {
            if let Err(e) = self.dispatch(packet) {
                if e.is_flow_local() {
                    debug!("Dropped packet: {}", e);
                } else {
                    warn!("Failed to dispatch packet: {}", e);
                }
            }
        }

        if self.is_empty() {
            info!("Ingress closed, dispatcher stopping");
        } else {
            info!(
                "Ingress closed, dispatcher stopping with {} live flows",
                self.len()
            );
        }
    }

    /// Route one packet. Errors only concern this packet.
    pub fn dispatch(&mut self, packet: Packet) -> Result<()> {
        self.evict_closed();

        let key = FlowKey::of(&packet);
        if !self.registry.contains_key(&key) {
            self.open_flow(key, &packet);
        }

        let entry = self
            .registry
            .get(&key)
            .ok_or(EngineError::ChannelClosed("flow registry"))?;

        match entry.input.try_send(packet) {
            Ok(()) => {
                self.context.stats.packet_dispatched();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.context.stats.packet_dropped();
                Err(EngineError::QueueFull("flow input"))
            }
            Err(TrySendError::Closed(_)) => {
                self.context.stats.packet_dropped();
                Err(EngineError::ChannelClosed("flow input"))
            }
        }
    }

    /// Evict every flow named by a pending close notice
    fn evict_closed(&mut self) {
        for notice in self.context.close_notices.drain() {
            let current = self.registry.get(&notice.key).map(|e| e.tcb.id());
            if current == Some(notice.tunnel_id) {
                self.registry.remove(&notice.key);
                self.context.stats.flow_evicted();
                info!("Removed tunnel {} [{}]", notice.tunnel_id, notice.key);
            }
        }
    }

    fn open_flow(&mut self, key: FlowKey, packet: &Packet) {
        let tcb = Arc::new(Tcb::new(
            packet.source,
            packet.destination,
            Arc::clone(&self.context),
        ));
        let (input, rx) = mpsc::channel(self.config.flow_queue_capacity);

        UpstreamWorker::new(
            Arc::clone(&tcb),
            rx,
            Arc::clone(&self.protector),
            Arc::clone(&self.config),
            Arc::clone(&self.context.stats),
        )
        .spawn();

        debug!("Opened tunnel {} [{}]", tcb.id(), key);
        self.context.stats.flow_opened();
        self.registry.insert(key, FlowEntry { tcb, input });
    }

    /// Live TCB for a key, if any
    pub fn flow(&self, key: &FlowKey) -> Option<Arc<Tcb>> {
        self.registry.get(key).map(|e| Arc::clone(&e.tcb))
    }

    /// Number of registered flows
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Ipv4TcpCodec, TcpFlags};
    use crate::tunnel::protect::NoopProtector;
    use std::net::SocketAddrV4;

    fn dispatcher(flow_queue_capacity: usize) -> (Dispatcher, mpsc::Receiver<Bytes>) {
        let (egress, rx) = mpsc::channel(64);
        let config = TunnelConfig {
            flow_queue_capacity,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(
            config,
            Arc::new(Ipv4TcpCodec::new()),
            Arc::new(NoopProtector),
            egress,
        );
        (dispatcher, rx)
    }

    fn syn(source_port: u16) -> Packet {
        let app = SocketAddrV4::new([10, 0, 1, 2].into(), source_port);
        // Unroutable remote; the current-thread runtime never polls the
        // spawned workers inside these synchronous tests
        let remote: SocketAddrV4 = "192.0.2.1:443".parse().unwrap();
        Packet::new(app, remote, TcpFlags::SYN, 100, 0, Bytes::new())
    }

    #[tokio::test]
    async fn test_first_packet_opens_flow() {
        let (mut dispatcher, _egress) = dispatcher(8);

        dispatcher.dispatch(syn(5000)).unwrap();
        dispatcher.dispatch(syn(5000)).unwrap();
        dispatcher.dispatch(syn(5001)).unwrap();

        assert_eq!(dispatcher.len(), 2);
        let stats = dispatcher.stats();
        assert_eq!(stats.flows_opened, 2);
        assert_eq!(stats.packets_dispatched, 3);
    }

    #[tokio::test]
    async fn test_full_flow_queue_drops() {
        let (mut dispatcher, _egress) = dispatcher(1);

        dispatcher.dispatch(syn(5000)).unwrap();
        let err = dispatcher.dispatch(syn(5000)).unwrap_err();
        assert!(matches!(err, EngineError::QueueFull(_)));
        assert!(dispatcher.dispatch(syn(5000)).is_err());

        let stats = dispatcher.stats();
        assert_eq!(stats.packets_dispatched, 1);
        assert_eq!(stats.packets_dropped, 2);
        assert_eq!(dispatcher.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_flow_is_replaced() {
        let (mut dispatcher, _egress) = dispatcher(8);
        let key = FlowKey::of(&syn(5000));

        dispatcher.dispatch(syn(5000)).unwrap();
        let first = dispatcher.flow(&key).unwrap();
        first.on_syn(&syn(5000));
        first.on_fin(&Packet::new(
            first.source(),
            first.destination(),
            TcpFlags::FIN | TcpFlags::ACK,
            101,
            0,
            Bytes::new(),
        ));
        first.close_downstream();

        dispatcher.dispatch(syn(5000)).unwrap();
        let second = dispatcher.flow(&key).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), second.id());
        assert_eq!(second.snapshot().syn_count, 0);
        assert!(second.snapshot().upstream_active);
        assert_eq!(dispatcher.len(), 1);
        assert_eq!(dispatcher.stats().flows_evicted, 1);
    }

    #[tokio::test]
    async fn test_stale_notice_keeps_newer_tunnel() {
        let (mut dispatcher, _egress) = dispatcher(8);
        let key = FlowKey::of(&syn(5000));

        dispatcher.dispatch(syn(5000)).unwrap();
        let tcb = dispatcher.flow(&key).unwrap();
        dispatcher.context.close_notices.publish(crate::tunnel::close::CloseNotice {
            key,
            tunnel_id: tcb.id() + 1_000_000,
        });

        dispatcher.dispatch(syn(5000)).unwrap();
        assert!(Arc::ptr_eq(&tcb, &dispatcher.flow(&key).unwrap()));
        assert_eq!(dispatcher.stats().flows_evicted, 0);
    }

    #[tokio::test]
    async fn test_half_closed_flow_is_kept() {
        let (mut dispatcher, _egress) = dispatcher(8);
        let key = FlowKey::of(&syn(5000));

        dispatcher.dispatch(syn(5000)).unwrap();
        let tcb = dispatcher.flow(&key).unwrap();
        tcb.on_syn(&syn(5000));
        tcb.close_downstream();

        dispatcher.dispatch(syn(5000)).unwrap();
        assert!(Arc::ptr_eq(&tcb, &dispatcher.flow(&key).unwrap()));
    }
}
