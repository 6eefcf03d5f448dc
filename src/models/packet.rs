//! Captured packet model
//!
//! A raw datagram enters the pipeline as a [`RawPacket`] and leaves it as a
//! [`PacketRecord`] handed to the active dump backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a datagram relative to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Leaving the device (read from the virtual interface)
    Sent,
    /// Arriving at the device (written back to the virtual interface)
    Received,
}

impl Direction {
    /// Wire value used by the UDP export format
    pub fn as_u8(self) -> u8 {
        match self {
            Direction::Sent => 0,
            Direction::Received => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::Sent),
            1 => Some(Direction::Received),
            _ => None,
        }
    }
}

/// A raw IP datagram observed on the virtual interface
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub direction: Direction,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl RawPacket {
    /// Wrap a datagram observed right now
    pub fn new(direction: Direction, data: Vec<u8>) -> Self {
        Self {
            direction,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn sent(data: Vec<u8>) -> Self {
        Self::new(Direction::Sent, data)
    }

    pub fn received(data: Vec<u8>) -> Self {
        Self::new(Direction::Received, data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A single unit dispatched to a dump backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    /// Datagram bytes; cleartext when the TLS stage decrypted the flow
    pub payload: Vec<u8>,
    /// Whether `payload` was synthesized from decrypted TLS data
    pub decrypted: bool,
}

impl PacketRecord {
    pub fn new(timestamp: DateTime<Utc>, direction: Direction, payload: Vec<u8>) -> Self {
        Self {
            timestamp,
            direction,
            payload,
            decrypted: false,
        }
    }

    /// Record carrying the datagram exactly as observed
    pub fn from_raw(packet: &RawPacket) -> Self {
        Self::new(packet.timestamp, packet.direction, packet.data.clone())
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Seconds part of the capture timestamp, as stored in pcap headers
    pub fn ts_sec(&self) -> u32 {
        self.timestamp.timestamp().clamp(0, u32::MAX as i64) as u32
    }

    /// Microseconds part of the capture timestamp
    pub fn ts_usec(&self) -> u32 {
        self.timestamp.timestamp_subsec_micros().min(999_999)
    }
}
