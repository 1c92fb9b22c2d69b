// src/tunnel/stats.rs
//! Tunnel counters
//!
//! Kept as plain atomics for cheap snapshots and mirrored to the `metrics`
//! facade so an installed exporter picks them up.

use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared tunnel counters
#[derive(Debug, Default)]
pub struct TunnelStats {
    packets_dispatched: AtomicU64,
    packets_dropped: AtomicU64,
    flows_opened: AtomicU64,
    flows_evicted: AtomicU64,
    connect_failures: AtomicU64,
    resets: AtomicU64,
    frames_dropped: AtomicU64,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_dispatched(&self) {
        self.packets_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Device packet dropped because its flow queue was full or gone
    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        counter!("netcap_packets_dropped_total").increment(1);
    }

    pub fn flow_opened(&self) {
        self.flows_opened.fetch_add(1, Ordering::Relaxed);
        counter!("netcap_flows_opened_total").increment(1);
    }

    pub fn flow_evicted(&self) {
        self.flows_evicted.fetch_add(1, Ordering::Relaxed);
        counter!("netcap_flows_evicted_total").increment(1);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        counter!("netcap_connect_failures_total").increment(1);
    }

    pub fn reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
        counter!("netcap_resets_total").increment(1);
    }

    /// Synthetic frame dropped because the egress queue was full
    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        counter!("netcap_frames_dropped_total").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_dispatched: self.packets_dispatched.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            flows_opened: self.flows_opened.load(Ordering::Relaxed),
            flows_evicted: self.flows_evicted.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TunnelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_dispatched: u64,
    pub packets_dropped: u64,
    pub flows_opened: u64,
    pub flows_evicted: u64,
    pub connect_failures: u64,
    pub resets: u64,
    pub frames_dropped: u64,
}

impl StatsSnapshot {
    /// Flows opened but not yet evicted
    pub fn live_flows(&self) -> u64 {
        self.flows_opened.saturating_sub(self.flows_evicted)
    }

    /// Percentage of device packets dropped before reaching a flow
    pub fn drop_rate(&self) -> f64 {
        let total = self.packets_dispatched + self.packets_dropped;
        if total == 0 {
            0.0
        } else {
            (self.packets_dropped as f64 / total as f64) * 100.0
        }
    }
}
