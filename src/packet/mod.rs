// src/packet/mod.rs
//! IPv4/TCP packet views and the codec contract
//!
//! The tunnel core never touches raw header bytes itself. It receives decoded
//! [`Packet`] views from the device side and asks a [`PacketCodec`] to build
//! the synthetic segments it sends back.
//!
//! ```text
//! TUN frame ──decode──► Packet ──► Dispatcher ──► TCB
//!                                                  │
//! TUN frame ◄──build_tcp_packet + update_tcp_buffer┘
//! ```

pub mod codec;
pub mod flags;

pub use codec::{Ipv4TcpCodec, PacketCodec, HEADER_SIZE};
pub use flags::TcpFlags;

use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Decoded view of one IPv4/TCP frame read from the virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Application side of the flow
    pub source: SocketAddrV4,

    /// Remote endpoint the application is talking to
    pub destination: SocketAddrV4,

    pub flags: TcpFlags,

    pub sequence_number: u32,

    pub acknowledgement_number: u32,

    /// IPv4 identification of the frame
    pub identification: u16,

    /// TCP payload
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet view directly, mostly useful when the frame has already
    /// been parsed elsewhere
    pub fn new(
        source: SocketAddrV4,
        destination: SocketAddrV4,
        flags: TcpFlags,
        sequence_number: u32,
        acknowledgement_number: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            source,
            destination,
            flags,
            sequence_number,
            acknowledgement_number,
            identification: 0,
            payload: payload.into(),
        }
    }

    pub fn destination_address(&self) -> Ipv4Addr {
        *self.destination.ip()
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}
