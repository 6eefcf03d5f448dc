//! Aggregate traffic counters

use serde::{Deserialize, Serialize};

use super::Direction;

/// Byte and packet counters for one capture session
///
/// Reset to zero when a session starts and never decrease until the next start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl VpnStats {
    pub fn add(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Sent => {
                self.bytes_sent = self.bytes_sent.saturating_add(bytes);
                self.packets_sent = self.packets_sent.saturating_add(1);
            }
            Direction::Received => {
                self.bytes_received = self.bytes_received.saturating_add(bytes);
                self.packets_received = self.packets_received.saturating_add(1);
            }
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }

    pub fn total_packets(&self) -> u64 {
        self.packets_sent.saturating_add(self.packets_received)
    }
}

/// Diagnostic counters that live alongside [`VpnStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureCounters {
    /// Datagrams handed to `ingest` while no capture was running
    pub dropped_packets: u64,
    /// Records the active backend failed to write
    pub write_failures: u64,
    /// Flows whose TLS interception failed and fell back to pass-through
    pub tls_failures: u64,
    /// Datagrams written back to the device side of the tunnel
    pub injected_packets: u64,
    /// Injection or forwarding attempts the tunnel rejected
    pub inject_failures: u64,
}
