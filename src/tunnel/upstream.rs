// src/tunnel/upstream.rs
//! Upstream worker: device → real destination
//!
//! Connects the real socket, starts the downstream worker, then consumes the
//! flow's input queue in arrival order and drives the TCB state machine.
//! Flag precedence per packet is SYN, RST, FIN, ACK.
//!
//! Only a flow that opens with a SYN is connected. Anything else, such as the
//! final ACK of a flow that was just evicted, reaps the TCB without touching
//! the network.

use crate::packet::Packet;
use crate::tunnel::downstream::DownstreamWorker;
use crate::tunnel::protect::SocketProtector;
use crate::tunnel::stats::TunnelStats;
use crate::tunnel::tcb::Tcb;
use crate::utils::config::TunnelConfig;
use crate::utils::errors::{EngineError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// What the state loop does after one packet
enum Next {
    Continue,
    Stop,
}

/// Per-flow upstream task
pub struct UpstreamWorker {
    tcb: Arc<Tcb>,
    input: mpsc::Receiver<Packet>,
    protector: Arc<dyn SocketProtector>,
    config: Arc<TunnelConfig>,
    stats: Arc<TunnelStats>,
}

impl UpstreamWorker {
    pub fn new(
        tcb: Arc<Tcb>,
        input: mpsc::Receiver<Packet>,
        protector: Arc<dyn SocketProtector>,
        config: Arc<TunnelConfig>,
        stats: Arc<TunnelStats>,
    ) -> Self {
        Self {
            tcb,
            input,
            protector,
            config,
            stats,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let id = self.tcb.id();
        let key = self.tcb.key();

        let first = match self.input.recv().await {
            Some(packet) if packet.is_syn() => packet,
            Some(packet) => {
                debug!(
                    "Tunnel {} [{}]: opened by {:?} without SYN, not connecting",
                    id, key, packet.flags
                );
                self.tcb.abandon();
                return;
            }
            None => {
                self.tcb.abandon();
                return;
            }
        };

        let stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Tunnel {} [{}]: {}", id, key, e);
                self.stats.connect_failed();
                self.tcb.abandon();
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        self.tcb.attach_socket();
        DownstreamWorker::new(Arc::clone(&self.tcb), reader, self.config.read_buffer_size).spawn();

        self.pump(first, writer).await;
        debug!("Tunnel {} [{}]: upstream worker quit", id, key);
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = SocketAddr::V4(self.tcb.destination());
        let socket = TcpSocket::new_v4()?;
        self.protector
            .protect(&socket)
            .map_err(|e| EngineError::ProtectFailed(e.to_string()))?;

        let started = std::time::Instant::now();
        let stream = match timeout(self.config.connect_timeout(), socket.connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(EngineError::ConnectFailed {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(EngineError::ConnectTimeout(addr)),
        };

        debug!(
            "Tunnel {} [{}]: connected to {} in {:?}",
            self.tcb.id(),
            self.tcb.key(),
            addr,
            started.elapsed()
        );
        Ok(stream)
    }

    async fn pump(&mut self, first: Packet, writer: OwnedWriteHalf) {
        let closed = self.tcb.close_token();
        let idle = self.config.idle_timeout();
        let mut writer = Some(writer);

        let mut pending = Some(first);
        loop {
            let packet = match pending.take() {
                Some(packet) => packet,
                None => {
                    let next = tokio::select! {
                        _ = closed.cancelled() => break,
                        next = recv(&mut self.input, idle) => next,
                    };
                    match next {
                        Ok(Some(packet)) => packet,
                        Ok(None) => break,
                        Err(_) => {
                            info!(
                                "Tunnel {} [{}]: idle for {:?}, resetting",
                                self.tcb.id(),
                                self.tcb.key(),
                                idle.unwrap_or_default()
                            );
                            self.tcb.reset();
                            break;
                        }
                    }
                }
            };

            match self.handle(packet, &mut writer).await {
                Ok(Next::Continue) => {}
                Ok(Next::Stop) => break,
                Err(e) => {
                    warn!("Tunnel {} [{}]: upstream failed: {}", self.tcb.id(), self.tcb.key(), e);
                    self.tcb.reset();
                    break;
                }
            }
        }
    }

    async fn handle(&self, packet: Packet, writer: &mut Option<OwnedWriteHalf>) -> Result<Next> {
        if packet.is_syn() {
            self.tcb.on_syn(&packet);
            return Ok(Next::Continue);
        }

        if packet.is_rst() {
            self.tcb.on_rst();
            return Ok(Next::Stop);
        }

        if packet.is_fin() {
            self.forward(&packet, writer).await?;
            self.tcb.on_fin(&packet);
            if let Some(mut w) = writer.take() {
                if let Err(e) = w.shutdown().await {
                    debug!("Tunnel {}: shutdown of write half failed: {}", self.tcb.id(), e);
                }
            }
            return Ok(Next::Continue);
        }

        if packet.is_ack() {
            self.forward(&packet, writer).await?;
        }

        Ok(Next::Continue)
    }

    /// Write accepted payload to the real socket, then acknowledge it
    async fn forward(&self, packet: &Packet, writer: &mut Option<OwnedWriteHalf>) -> Result<()> {
        let Some(data) = self.tcb.on_ack(packet) else {
            return Ok(());
        };

        match writer.as_mut() {
            Some(w) => {
                w.write_all(&data).await?;
                self.tcb.acknowledge();
            }
            None => debug!(
                "Tunnel {}: write half already shut down, {} bytes dropped",
                self.tcb.id(),
                data.len()
            ),
        }
        Ok(())
    }
}

async fn recv(
    input: &mut mpsc::Receiver<Packet>,
    idle: Option<Duration>,
) -> std::result::Result<Option<Packet>, tokio::time::error::Elapsed> {
    match idle {
        Some(limit) => timeout(limit, input.recv()).await,
        None => Ok(input.recv().await),
    }
}
