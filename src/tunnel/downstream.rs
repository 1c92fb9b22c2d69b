// src/tunnel/downstream.rs
//! Downstream worker: real destination → device

use crate::tunnel::tcb::Tcb;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Why the read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Remote closed its side
    EndOfStream,
    /// Read failed
    Failed,
    /// Another path already tore the flow down
    Cancelled,
}

/// Per-flow downstream task
pub struct DownstreamWorker {
    tcb: Arc<Tcb>,
    reader: OwnedReadHalf,
    buffer_size: usize,
}

impl DownstreamWorker {
    pub fn new(tcb: Arc<Tcb>, reader: OwnedReadHalf, buffer_size: usize) -> Self {
        Self {
            tcb,
            reader,
            buffer_size,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let closed = self.tcb.close_token();

        // Sequence state does not exist until the device's SYN is handled
        tokio::select! {
            _ = self.tcb.synchronized() => {}
            _ = closed.cancelled() => return,
        }

        let mut buf = vec![0u8; self.buffer_size];
        let exit = loop {
            let read = tokio::select! {
                _ = closed.cancelled() => break Exit::Cancelled,
                read = self.reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => break Exit::EndOfStream,
                Ok(n) => self.tcb.push_downstream(&buf[..n]),
                Err(e) => {
                    warn!("Tunnel {} [{}]: read failed: {}", self.tcb.id(), self.tcb.key(), e);
                    break Exit::Failed;
                }
            }
        };

        match exit {
            Exit::EndOfStream => self.tcb.close_downstream(),
            Exit::Failed => {
                self.tcb.reset();
            }
            Exit::Cancelled => {}
        }
        debug!(
            "Tunnel {} [{}]: downstream worker quit ({:?})",
            self.tcb.id(),
            self.tcb.key(),
            exit
        );
    }
}
