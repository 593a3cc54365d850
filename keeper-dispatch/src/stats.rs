//! Connection/request statistics, tracked the way `KeeperDispatcher::keeper_stats` does:
//! packet counters plus a running request-latency average. Exposed for whatever admin/metrics
//! surface the embedder wires up; this crate only maintains the counters.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[derive(Default)]
pub struct ConnectionStats {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_packets_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_packets_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency_ms(&self, latency_ms: u64) {
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.latency_sum_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn reset(&self) {
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.latency_sum_ms.store(0, Ordering::Relaxed);
        self.latency_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_latency_is_zero_with_no_samples() {
        let stats = ConnectionStats::new();
        assert_eq!(stats.avg_latency_ms(), 0.0);
    }

    #[test]
    fn tracks_counters_and_average() {
        let stats = ConnectionStats::new();
        stats.increment_packets_received();
        stats.increment_packets_received();
        stats.increment_packets_sent();
        stats.record_latency_ms(10);
        stats.record_latency_ms(20);
        assert_eq!(stats.packets_received(), 2);
        assert_eq!(stats.packets_sent(), 1);
        assert_eq!(stats.avg_latency_ms(), 15.0);
        stats.reset();
        assert_eq!(stats.packets_received(), 0);
    }
}
