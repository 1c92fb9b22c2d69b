// src/tunnel/tcb.rs
//! Tunnel control block
//!
//! One TCB per proxied flow. The upstream and downstream workers of a flow
//! share it; every read or write of its sequence numbers, status and
//! half-close flags happens under `state`, and the lock is only held while
//! state is updated and a frame is composed. Frames are pushed to the egress
//! queue and close notices are published after the lock is released.
//!
//! # State machine
//!
//! ```text
//! SYN_SENT ──SYN──► SYN_RECEIVED ──ACK──► ESTABLISHED ──FIN──► CLOSE_WAIT
//!     └──────────────────── RST (any state) ─────────────────────┘
//! ```
//!
//! The coarse status tracks handshake progress; `upstream_active` and
//! `downstream_active` track each direction's closure independently. A flow
//! is evicted once both flags are false.

use crate::packet::{Packet, PacketCodec, TcpFlags, HEADER_SIZE};
use crate::tunnel::close::{CloseNotice, CloseNotices};
use crate::tunnel::stats::TunnelStats;
use crate::utils::errors::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

static TUNNEL_IDS: AtomicU64 = AtomicU64::new(1);

/// `a <= b` in 32-bit serial number arithmetic
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a > b` in 32-bit serial number arithmetic
pub fn seq_gt(a: u32, b: u32) -> bool {
    !seq_le(a, b)
}

/// Identifies one live tunnel. The source address is always the local
/// virtual interface, so it is not part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub destination: Ipv4Addr,
    pub destination_port: u16,
    pub source_port: u16,
}

impl FlowKey {
    pub fn new(destination: Ipv4Addr, destination_port: u16, source_port: u16) -> Self {
        Self {
            destination,
            destination_port,
            source_port,
        }
    }

    pub fn of(packet: &Packet) -> Self {
        Self::new(
            packet.destination_address(),
            packet.destination.port(),
            packet.source.port(),
        )
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.destination, self.destination_port, self.source_port
        )
    }
}

/// Coarse handshake status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcbStatus {
    SynSent,
    SynReceived,
    Established,
    CloseWait,
}

/// Mutable per-flow state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcbState {
    pub status: TcbStatus,

    /// Next sequence number we send toward the device
    pub local_seq: u32,

    /// Next sequence number we expect from the device
    pub local_ack: u32,

    /// Last sequence number seen from the device
    pub remote_seq: u32,

    /// Last acknowledgement number seen from the device
    pub remote_ack: u32,

    /// Device-to-remote direction still open
    pub upstream_active: bool,

    /// Remote-to-device direction still open
    pub downstream_active: bool,

    /// IPv4 identification of the next synthetic frame
    pub packet_id: u16,

    /// SYNs seen so far (retransmits included)
    pub syn_count: u32,

    /// Real socket connected and not yet closed
    pub socket_open: bool,

    close_notified: bool,
}

impl Default for TcbState {
    fn default() -> Self {
        Self {
            status: TcbStatus::SynSent,
            local_seq: 0,
            local_ack: 0,
            remote_seq: 0,
            remote_ack: 0,
            upstream_active: true,
            downstream_active: true,
            packet_id: 1,
            syn_count: 0,
            socket_open: false,
            close_notified: false,
        }
    }
}

impl TcbState {
    pub fn is_closed(&self) -> bool {
        !self.upstream_active && !self.downstream_active
    }

    /// Claim the single close notice once both directions are inactive
    fn claim_close_notice(&mut self) -> bool {
        if self.is_closed() && !self.close_notified {
            self.close_notified = true;
            true
        } else {
            false
        }
    }
}

/// Shared collaborators every TCB talks to
pub struct FlowContext {
    pub codec: Arc<dyn PacketCodec>,
    pub egress: mpsc::Sender<Bytes>,
    pub close_notices: Arc<CloseNotices>,
    pub stats: Arc<TunnelStats>,
}

/// Per-flow tunnel control block
pub struct Tcb {
    id: u64,
    key: FlowKey,

    /// Application endpoint on the virtual interface
    source: SocketAddrV4,

    /// Real destination
    destination: SocketAddrV4,

    state: Mutex<TcbState>,

    /// Cancelled when the socket is torn down or both directions are closed
    closed: CancellationToken,

    /// Cancelled once the first SYN has initialised the sequence state
    synchronized: CancellationToken,

    context: Arc<FlowContext>,
}

impl Tcb {
    pub fn new(source: SocketAddrV4, destination: SocketAddrV4, context: Arc<FlowContext>) -> Self {
        let key = FlowKey::new(*destination.ip(), destination.port(), source.port());
        Self {
            id: TUNNEL_IDS.fetch_add(1, Ordering::Relaxed),
            key,
            source,
            destination,
            state: Mutex::new(TcbState::default()),
            closed: CancellationToken::new(),
            synchronized: CancellationToken::new(),
            context,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn source(&self) -> SocketAddrV4 {
        self.source
    }

    pub fn destination(&self) -> SocketAddrV4 {
        self.destination
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> TcbState {
        self.state.lock().clone()
    }

    /// Token cancelled when the flow is finished
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Resolves once the handshake sequence state exists
    pub fn synchronized(&self) -> WaitForCancellationFuture<'_> {
        self.synchronized.cancelled()
    }

    /// Record that the real socket is connected
    pub fn attach_socket(&self) {
        self.state.lock().socket_open = true;
    }

    /// Handle a SYN from the device. The first one initialises the sequence
    /// state and answers SYN+ACK; retransmits during the handshake only
    /// re-sync `local_ack`.
    pub fn on_syn(&self, packet: &Packet) {
        let frame = {
            let mut state = self.state.lock();
            if state.status == TcbStatus::SynSent {
                state.status = TcbStatus::SynReceived;
            }

            let first = state.syn_count == 0;
            state.syn_count += 1;
            // Past the handshake a SYN must not pull local_ack back
            if state.status == TcbStatus::SynReceived {
                state.local_ack = packet.sequence_number.wrapping_add(1);
            }

            if first {
                state.local_seq = rand::random();
                state.remote_seq = packet.sequence_number;
                state.remote_ack = packet.acknowledgement_number;
                Some(self.compose(&mut state, TcpFlags::SYN | TcpFlags::ACK, &[]))
            } else {
                debug!(
                    "Tunnel {} [{}]: retransmitted SYN #{}",
                    self.id, self.key, state.syn_count
                );
                None
            }
        };

        if let Some(frame) = frame {
            self.synchronized.cancel();
            self.emit(frame);
        }
    }

    /// Handle the ACK part of a device packet.
    ///
    /// Returns the payload to forward to the real socket, if any. After the
    /// write succeeds the caller must call [`Tcb::acknowledge`]. Stale or
    /// duplicate segments return `None` without touching the state.
    pub fn on_ack(&self, packet: &Packet) -> Option<Bytes> {
        let mut state = self.state.lock();
        if state.status == TcbStatus::SynReceived {
            state.status = TcbStatus::Established;
            info!("Tunnel {} [{}]: established", self.id, self.key);
        }

        if packet.payload.is_empty() {
            return None;
        }

        if state.syn_count == 0 || !state.upstream_active {
            debug!(
                "Tunnel {} [{}]: dropping {} bytes outside an open upstream",
                self.id,
                self.key,
                packet.payload_len()
            );
            return None;
        }

        let candidate = packet
            .sequence_number
            .wrapping_add(packet.payload_len() as u32);
        if seq_le(candidate, state.local_ack) {
            debug!(
                "Tunnel {} [{}]: duplicate segment (ack {} <= {})",
                self.id, self.key, candidate, state.local_ack
            );
            return None;
        }

        state.local_ack = candidate;
        state.remote_seq = packet.sequence_number;
        state.remote_ack = packet.acknowledgement_number;
        Some(packet.payload.clone())
    }

    /// Acknowledge data that has been written to the real socket
    pub fn acknowledge(&self) {
        self.send(TcpFlags::ACK, &[]);
    }

    /// Handle a FIN from the device: acknowledge it, close the upstream
    /// direction and move to CLOSE_WAIT.
    pub fn on_fin(&self, packet: &Packet) {
        let (frame, notify) = {
            let mut state = self.state.lock();
            let fin_ack = packet
                .sequence_number
                .wrapping_add(packet.payload_len() as u32)
                .wrapping_add(1);
            if seq_gt(fin_ack, state.local_ack) {
                state.local_ack = fin_ack;
            }
            state.remote_seq = packet.sequence_number;
            state.remote_ack = packet.acknowledgement_number;

            let frame = self.compose(&mut state, TcpFlags::ACK, &[]);
            state.status = TcbStatus::CloseWait;
            state.upstream_active = false;
            (frame, state.claim_close_notice())
        };

        info!("Tunnel {} [{}]: upstream closed by device", self.id, self.key);
        self.emit(frame);
        if notify {
            self.notify_closed();
        }
    }

    /// Handle an RST from the device. Tears the socket down without replying.
    /// Returns whether this call closed the socket.
    pub fn on_rst(&self) -> bool {
        info!("Tunnel {} [{}]: reset by device", self.id, self.key);
        self.teardown(false)
    }

    /// Emit data read from the real socket as an ACK+data segment
    pub fn push_downstream(&self, data: &[u8]) {
        let frame = {
            let mut state = self.state.lock();
            if !state.downstream_active || state.syn_count == 0 {
                debug!(
                    "Tunnel {} [{}]: discarding {} downstream bytes",
                    self.id,
                    self.key,
                    data.len()
                );
                return;
            }
            self.compose(&mut state, TcpFlags::ACK, data)
        };
        self.emit(frame);
    }

    /// Remote closed its side: send FIN+ACK and close the downstream direction
    pub fn close_downstream(&self) {
        let (frame, notify) = {
            let mut state = self.state.lock();
            if !state.downstream_active {
                return;
            }
            let frame = self.compose(&mut state, TcpFlags::FIN | TcpFlags::ACK, &[]);
            state.downstream_active = false;
            (frame, state.claim_close_notice())
        };

        info!("Tunnel {} [{}]: downstream closed by remote", self.id, self.key);
        self.emit(frame);
        if notify {
            self.notify_closed();
        }
    }

    /// Hard reset: close the socket, send RST, mark both directions inactive.
    /// Returns whether this call closed the socket.
    pub fn reset(&self) -> bool {
        warn!("Tunnel {} [{}]: resetting", self.id, self.key);
        self.teardown(true)
    }

    /// The real socket never came up; reap the tunnel without talking to the device
    pub fn abandon(&self) {
        let notify = {
            let mut state = self.state.lock();
            state.upstream_active = false;
            state.downstream_active = false;
            state.claim_close_notice()
        };
        if notify {
            self.notify_closed();
        }
        self.closed.cancel();
    }

    fn teardown(&self, send_rst: bool) -> bool {
        let (socket_closed, frame, notify) = {
            let mut state = self.state.lock();
            let socket_closed = std::mem::replace(&mut state.socket_open, false);
            let frame = (send_rst && !state.is_closed())
                .then(|| self.compose(&mut state, TcpFlags::RST, &[]));
            state.upstream_active = false;
            state.downstream_active = false;
            state.status = TcbStatus::CloseWait;
            (socket_closed, frame, state.claim_close_notice())
        };

        if socket_closed {
            self.context.stats.reset();
        }
        self.closed.cancel();
        if let Some(frame) = frame {
            self.emit(frame);
        }
        if notify {
            self.notify_closed();
        }
        socket_closed
    }

    fn send(&self, flags: TcpFlags, payload: &[u8]) {
        let frame = {
            let mut state = self.state.lock();
            self.compose(&mut state, flags, payload)
        };
        self.emit(frame);
    }

    /// Build a frame from the current state and advance the sequence number.
    /// Must be called with the state lock held.
    fn compose(&self, state: &mut TcbState, flags: TcpFlags, payload: &[u8]) -> Result<Bytes> {
        let codec = &self.context.codec;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        codec.build_tcp_packet(
            &mut buf,
            self.destination,
            self.source,
            flags,
            state.local_ack,
            state.local_seq,
            state.packet_id,
        )?;
        buf.extend_from_slice(payload);
        codec.update_tcp_buffer(&mut buf, flags, state.local_seq, state.local_ack, payload.len())?;

        state.packet_id = state.packet_id.wrapping_add(1);
        if flags.consumes_sequence() {
            state.local_seq = state.local_seq.wrapping_add(1);
        }
        state.local_seq = state.local_seq.wrapping_add(payload.len() as u32);

        Ok(Bytes::from(buf))
    }

    fn emit(&self, frame: Result<Bytes>) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Tunnel {} [{}]: failed to build frame: {}", self.id, self.key, e);
                return;
            }
        };

        match self.context.egress.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Tunnel {} [{}]: egress queue full, frame dropped", self.id, self.key);
                self.context.stats.frame_dropped();
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Tunnel {} [{}]: egress queue closed", self.id, self.key);
            }
        }
    }

    fn notify_closed(&self) {
        info!("Tunnel {} [{}]: both directions closed", self.id, self.key);
        self.context.close_notices.publish(CloseNotice {
            key: self.key,
            tunnel_id: self.id,
        });
        self.closed.cancel();
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &*self.state.lock())
            .finish()
    }
}
