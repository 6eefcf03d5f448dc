//! Statistics aggregation
//!
//! The capture path is the only writer; the notification ticker and external
//! queries only take snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::models::{CaptureCounters, Direction, VpnStats};

/// Single-writer, many-reader holder for [`VpnStats`]
///
/// Bytes and packets of one direction are updated under the same write lock,
/// so a snapshot never shows one without the other.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    inner: RwLock<VpnStats>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, direction: Direction, byte_count: usize) {
        let mut stats = self.inner.write().unwrap_or_else(|e| e.into_inner());
        stats.add(direction, byte_count as u64);
    }

    pub fn snapshot(&self) -> VpnStats {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reset(&self) {
        let mut stats = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *stats = VpnStats::default();
    }
}

/// Lock-free diagnostic counters
#[derive(Debug, Default)]
pub struct CounterSet {
    dropped_packets: AtomicU64,
    write_failures: AtomicU64,
    tls_failures: AtomicU64,
    injected_packets: AtomicU64,
    inject_failures: AtomicU64,
}

impl CounterSet {
    pub fn packet_dropped(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_failed(&self) -> u64 {
        self.write_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn tls_failed(&self) {
        self.tls_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_injected(&self) {
        self.injected_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inject_failed(&self) {
        self.inject_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Clear the per-session counters; dropped packets accumulate across sessions
    pub fn reset_session(&self) {
        self.write_failures.store(0, Ordering::Relaxed);
        self.tls_failures.store(0, Ordering::Relaxed);
        self.injected_packets.store(0, Ordering::Relaxed);
        self.inject_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureCounters {
        CaptureCounters {
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            tls_failures: self.tls_failures.load(Ordering::Relaxed),
            injected_packets: self.injected_packets.load(Ordering::Relaxed),
            inject_failures: self.inject_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn records_each_direction_separately() {
        let stats = StatsAggregator::new();
        stats.record(Direction::Sent, 100);
        stats.record(Direction::Sent, 40);
        stats.record(Direction::Received, 1500);

        assert_eq!(
            stats.snapshot(),
            VpnStats {
                bytes_sent: 140,
                bytes_received: 1500,
                packets_sent: 2,
                packets_received: 1,
            }
        );

        stats.reset();
        assert_eq!(stats.snapshot(), VpnStats::default());
    }

    #[test]
    fn readers_never_see_bytes_without_packets() {
        let stats = Arc::new(StatsAggregator::new());
        let writer = {
            let stats = stats.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    stats.record(Direction::Sent, 10);
                }
            })
        };

        for _ in 0..1_000 {
            let snap = stats.snapshot();
            assert_eq!(snap.bytes_sent, snap.packets_sent * 10);
        }
        writer.join().unwrap();
        assert_eq!(stats.snapshot().packets_sent, 10_000);
    }
}
