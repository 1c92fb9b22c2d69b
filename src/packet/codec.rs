// src/packet/codec.rs
//! IPv4/TCP frame codec backed by etherparse
//!
//! Synthetic segments are produced in two steps: `build_tcp_packet` writes
//! option-less headers for an empty segment, the caller appends the payload
//! behind them, and `update_tcp_buffer` rewrites flags, sequence numbers,
//! lengths and checksums in place.

use crate::packet::{Packet, TcpFlags};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use etherparse::{IpNumber, Ipv4Header, TcpHeader};
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddrV4};

/// IPv4 header (20) + TCP header (20), no options
pub const HEADER_SIZE: usize = 40;

const TTL: u8 = 64;
const WINDOW_SIZE: u16 = 65535;

/// Codec contract consumed by the tunnel core
pub trait PacketCodec: Send + Sync {
    /// Write the headers of an empty TCP segment into `buf`, replacing its contents
    #[allow(clippy::too_many_arguments)]
    fn build_tcp_packet(
        &self,
        buf: &mut Vec<u8>,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        flags: TcpFlags,
        ack: u32,
        seq: u32,
        packet_id: u16,
    ) -> Result<()>;

    /// Rewrite flags, sequence numbers and payload length of a frame built by
    /// `build_tcp_packet` whose payload has been appended behind the headers
    fn update_tcp_buffer(
        &self,
        buf: &mut Vec<u8>,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        payload_len: usize,
    ) -> Result<()>;

    /// Parse a raw frame from the virtual interface
    fn decode(&self, frame: &[u8]) -> Result<Packet>;
}

/// Default codec for IPv4 frames carrying TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv4TcpCodec;

impl Ipv4TcpCodec {
    pub fn new() -> Self {
        Self
    }
}

fn codec_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Codec(e.to_string())
}

fn apply_flags(tcp: &mut TcpHeader, flags: TcpFlags) {
    tcp.fin = flags.contains(TcpFlags::FIN);
    tcp.syn = flags.contains(TcpFlags::SYN);
    tcp.rst = flags.contains(TcpFlags::RST);
    tcp.psh = flags.contains(TcpFlags::PSH);
    tcp.ack = flags.contains(TcpFlags::ACK);
    tcp.urg = flags.contains(TcpFlags::URG);
    tcp.ece = flags.contains(TcpFlags::ECE);
    tcp.cwr = flags.contains(TcpFlags::CWR);
}

fn read_flags(tcp: &TcpHeader) -> TcpFlags {
    let mut flags = TcpFlags::empty();
    flags.set(TcpFlags::FIN, tcp.fin);
    flags.set(TcpFlags::SYN, tcp.syn);
    flags.set(TcpFlags::RST, tcp.rst);
    flags.set(TcpFlags::PSH, tcp.psh);
    flags.set(TcpFlags::ACK, tcp.ack);
    flags.set(TcpFlags::URG, tcp.urg);
    flags.set(TcpFlags::ECE, tcp.ece);
    flags.set(TcpFlags::CWR, tcp.cwr);
    flags
}

impl PacketCodec for Ipv4TcpCodec {
    fn build_tcp_packet(
        &self,
        buf: &mut Vec<u8>,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        flags: TcpFlags,
        ack: u32,
        seq: u32,
        packet_id: u16,
    ) -> Result<()> {
        let mut tcp = TcpHeader::new(source.port(), destination.port(), seq, WINDOW_SIZE);
        tcp.acknowledgment_number = ack;
        apply_flags(&mut tcp, flags);

        let mut ip = Ipv4Header::new(
            tcp.header_len() as u16,
            TTL,
            IpNumber::TCP,
            source.ip().octets(),
            destination.ip().octets(),
        )
        .map_err(codec_err)?;
        ip.identification = packet_id;
        ip.dont_fragment = true;
        ip.header_checksum = ip.calc_header_checksum();

        tcp.checksum = tcp.calc_checksum_ipv4(&ip, &[]).map_err(codec_err)?;

        buf.clear();
        buf.reserve(HEADER_SIZE);
        ip.write(buf).map_err(codec_err)?;
        tcp.write(buf).map_err(codec_err)?;
        Ok(())
    }

    fn update_tcp_buffer(
        &self,
        buf: &mut Vec<u8>,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        payload_len: usize,
    ) -> Result<()> {
        let (mut ip, rest) = Ipv4Header::from_slice(buf).map_err(codec_err)?;
        let (mut tcp, _) = TcpHeader::from_slice(rest).map_err(codec_err)?;

        let tcp_len = tcp.header_len() as usize;
        let headers = ip.header_len() as usize + tcp_len;
        if buf.len() < headers + payload_len {
            return Err(EngineError::Codec(format!(
                "buffer holds {} payload bytes, {} requested",
                buf.len().saturating_sub(headers),
                payload_len
            )));
        }
        buf.truncate(headers + payload_len);

        apply_flags(&mut tcp, flags);
        tcp.sequence_number = seq;
        tcp.acknowledgment_number = ack;

        ip.set_payload_len(tcp_len + payload_len).map_err(codec_err)?;
        ip.header_checksum = ip.calc_header_checksum();
        tcp.checksum = tcp
            .calc_checksum_ipv4(&ip, &buf[headers..])
            .map_err(codec_err)?;

        let mut cursor = Cursor::new(&mut buf[..headers]);
        ip.write(&mut cursor).map_err(codec_err)?;
        tcp.write(&mut cursor).map_err(codec_err)?;
        Ok(())
    }

    fn decode(&self, frame: &[u8]) -> Result<Packet> {
        match frame.first().map(|b| b >> 4) {
            Some(4) => {}
            Some(v) => return Err(EngineError::Codec(format!("unsupported IP version {}", v))),
            None => return Err(EngineError::Codec("empty frame".to_string())),
        }

        let (ip, rest) = Ipv4Header::from_slice(frame).map_err(codec_err)?;
        if ip.protocol != IpNumber::TCP {
            return Err(EngineError::Codec(format!(
                "not a TCP frame (protocol {:?})",
                ip.protocol
            )));
        }

        let ip_payload_len = (ip.total_len as usize)
            .saturating_sub(ip.header_len() as usize)
            .min(rest.len());
        let (tcp, payload) = TcpHeader::from_slice(&rest[..ip_payload_len]).map_err(codec_err)?;

        Ok(Packet {
            source: SocketAddrV4::new(Ipv4Addr::from(ip.source), tcp.source_port),
            destination: SocketAddrV4::new(Ipv4Addr::from(ip.destination), tcp.destination_port),
            flags: read_flags(&tcp),
            sequence_number: tcp.sequence_number,
            acknowledgement_number: tcp.acknowledgment_number,
            identification: ip.identification,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}
