// src/tunnel/close.rs
//! Close-notification queue
//!
//! Workers publish a notice once both directions of a flow are inactive. The
//! dispatcher drains the queue before every lookup and evicts the named
//! entries, so the registry never has to coordinate with worker tasks at
//! close time.

use crate::tunnel::tcb::FlowKey;
use crossbeam::queue::SegQueue;

/// Eviction request for one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseNotice {
    pub key: FlowKey,

    /// Id of the tunnel that closed; a newer tunnel under the same key is kept
    pub tunnel_id: u64,
}

/// Lock-free, unbounded queue of close notices
#[derive(Debug, Default)]
pub struct CloseNotices {
    queue: SegQueue<CloseNotice>,
}

impl CloseNotices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a notice (non-blocking)
    pub fn publish(&self, notice: CloseNotice) {
        self.queue.push(notice);
    }

    /// Take every pending notice
    pub fn drain(&self) -> impl Iterator<Item = CloseNotice> + '_ {
        std::iter::from_fn(move || self.queue.pop())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn notice(port: u16, id: u64) -> CloseNotice {
        CloseNotice {
            key: FlowKey::new(Ipv4Addr::new(1, 2, 3, 4), 443, port),
            tunnel_id: id,
        }
    }

    #[test]
    fn test_publish_drain() {
        let notices = CloseNotices::new();
        notices.publish(notice(5000, 1));
        notices.publish(notice(5001, 2));
        assert_eq!(notices.len(), 2);

        let drained: Vec<_> = notices.drain().collect();
        assert_eq!(drained, vec![notice(5000, 1), notice(5001, 2)]);
        assert!(notices.is_empty());
    }

    #[test]
    fn test_concurrent_publish() {
        use std::thread;

        let notices = Arc::new(CloseNotices::new());
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let n = Arc::clone(&notices);
                thread::spawn(move || {
                    for j in 0..100u16 {
                        n.publish(notice(i * 100 + j, u64::from(j)));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(notices.drain().count(), 800);
    }
}
