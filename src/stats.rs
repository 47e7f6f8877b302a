//! Process-wide tunnel counters. Every splice session bumps these on start
//! and close; `log_snapshot` reports them the way the rest of the crate
//! reports everything else — through `tracing`, not stdout.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

pub struct TunnelStats {
    pub active_tunnels: AtomicU32,
    pub total_tunnels: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl TunnelStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active_tunnels: AtomicU32::new(0),
            total_tunnels: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        })
    }

    pub fn tunnel_started(&self) {
        self.active_tunnels.fetch_add(1, Ordering::Relaxed);
        self.total_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self, bytes_in: u64, bytes_out: u64) {
        self.active_tunnels.fetch_sub(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn log_snapshot(&self) {
        let active = self.active_tunnels.load(Ordering::Relaxed);
        let total = self.total_tunnels.load(Ordering::Relaxed);
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);

        info!(
            active,
            total,
            bytes_in_mb = bytes_in as f64 / 1_048_576.0,
            bytes_out_mb = bytes_out as f64 / 1_048_576.0,
            "tunnel stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_bumps_active_and_total() {
        let stats = TunnelStats::new();
        stats.tunnel_started();
        stats.tunnel_started();
        assert_eq!(stats.active_tunnels.load(Ordering::Relaxed), 2);
        assert_eq!(stats.total_tunnels.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn closed_decrements_active_and_accumulates_bytes() {
        let stats = TunnelStats::new();
        stats.tunnel_started();
        stats.tunnel_closed(100, 200);
        assert_eq!(stats.active_tunnels.load(Ordering::Relaxed), 0);
        assert_eq!(stats.bytes_in.load(Ordering::Relaxed), 100);
        assert_eq!(stats.bytes_out.load(Ordering::Relaxed), 200);
    }
}
