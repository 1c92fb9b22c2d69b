// src/tunnel/protect.rs
//! Exempting outbound sockets from capture
//!
//! Outbound sockets must bypass the virtual interface, otherwise the proxy's
//! own traffic would loop back into the ingress queue. On Linux this is done
//! with a firewall mark that a policy-routing rule sends out the real uplink.

use crate::utils::config::TunnelConfig;
use std::io;
use std::sync::Arc;
use tokio::net::TcpSocket;
use tracing::{debug, warn};

/// Platform capability consumed before every outbound connect
pub trait SocketProtector: Send + Sync {
    fn protect(&self, socket: &TcpSocket) -> io::Result<()>;
}

/// Does nothing; for hosts where routing already excludes the proxy
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _socket: &TcpSocket) -> io::Result<()> {
        Ok(())
    }
}

/// Tags sockets with `SO_MARK`
#[derive(Debug, Clone, Copy)]
pub struct FwmarkProtector {
    mark: u32,
}

impl FwmarkProtector {
    pub fn new(mark: u32) -> Self {
        Self { mark }
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }
}

impl SocketProtector for FwmarkProtector {
    fn protect(&self, socket: &TcpSocket) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;

            let mark = self.mark;
            // SAFETY: the fd is owned by `socket` and outlives the call; the
            // option value points at a live u32 of the advertised length.
            let ret = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_MARK,
                    &mark as *const u32 as *const libc::c_void,
                    std::mem::size_of::<u32>() as libc::socklen_t,
                )
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            debug!("Marked outbound socket with fwmark {:#x}", mark);
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = socket;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "SO_MARK is only available on Linux",
            ))
        }
    }
}

/// Pick the protector matching the tunnel configuration
pub fn from_config(config: &TunnelConfig) -> Arc<dyn SocketProtector> {
    match config.fwmark {
        Some(mark) => Arc::new(FwmarkProtector::new(mark)),
        None => {
            warn!("No fwmark configured, outbound sockets are not exempted from capture");
            Arc::new(NoopProtector)
        }
    }
}
