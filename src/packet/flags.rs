// src/packet/flags.rs
use bitflags::bitflags;

bitflags! {
    // Bit positions [ CWR, ECE, URG, ACK, PSH, RST, SYN, FIN ]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const CWR = 1 << 7;
        const ECE = 1 << 6;
        const URG = 1 << 5;
        const ACK = 1 << 4;
        const PSH = 1 << 3;
        const RST = 1 << 2;
        const SYN = 1 << 1;
        const FIN = 1 << 0;
    }
}

impl TcpFlags {
    /// Flags that move the local sequence number by one
    pub fn consumes_sequence(self) -> bool {
        self.intersects(TcpFlags::SYN | TcpFlags::FIN)
    }
}
