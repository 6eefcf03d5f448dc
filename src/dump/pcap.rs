//! Classic libpcap encoding
//!
//! Global header: 24 bytes, per-record header: 16 bytes, little-endian.
//! Datagrams are raw IP, so the link type is `LINKTYPE_RAW`.

use chrono::{TimeZone, Utc};
use thiserror::Error;

use crate::models::{Direction, PacketRecord};

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
pub const LINKTYPE_RAW: u32 = 101;
pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

pub fn global_header(snaplen: u32) -> [u8; GLOBAL_HEADER_LEN] {
    let mut out = [0u8; GLOBAL_HEADER_LEN];
    out[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
    out[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
    out[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
    // thiszone and sigfigs stay zero
    out[16..20].copy_from_slice(&snaplen.to_le_bytes());
    out[20..24].copy_from_slice(&LINKTYPE_RAW.to_le_bytes());
    out
}

pub fn record_header(record: &PacketRecord, snaplen: u32) -> [u8; RECORD_HEADER_LEN] {
    let orig_len = record.payload.len() as u32;
    let incl_len = orig_len.min(snaplen);
    let mut out = [0u8; RECORD_HEADER_LEN];
    out[0..4].copy_from_slice(&record.ts_sec().to_le_bytes());
    out[4..8].copy_from_slice(&record.ts_usec().to_le_bytes());
    out[8..12].copy_from_slice(&incl_len.to_le_bytes());
    out[12..16].copy_from_slice(&orig_len.to_le_bytes());
    out
}

/// Record header followed by the (snaplen-truncated) payload
pub fn encode_record(record: &PacketRecord, snaplen: u32) -> Vec<u8> {
    let header = record_header(record, snaplen);
    let incl_len = record.payload.len().min(snaplen as usize);
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + incl_len);
    out.extend_from_slice(&header);
    out.extend_from_slice(&record.payload[..incl_len]);
    out
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PcapParseError {
    #[error("buffer shorter than the pcap global header")]
    TruncatedHeader,
    #[error("unsupported pcap magic {0:#010x}")]
    BadMagic(u32),
    #[error("record {index} is truncated")]
    TruncatedRecord { index: usize },
}

/// Contents of a parsed pcap buffer
#[derive(Debug, Clone)]
pub struct PcapCapture {
    pub snaplen: u32,
    pub link_type: u32,
    pub records: Vec<PacketRecord>,
}

/// Parse a little-endian classic pcap buffer
///
/// Direction is not stored in pcap; parsed records report `Sent`.
pub fn read_pcap(data: &[u8]) -> Result<PcapCapture, PcapParseError> {
    if data.len() < GLOBAL_HEADER_LEN {
        return Err(PcapParseError::TruncatedHeader);
    }
    let magic = le_u32(data, 0);
    if magic != PCAP_MAGIC {
        return Err(PcapParseError::BadMagic(magic));
    }
    let snaplen = le_u32(data, 16);
    let link_type = le_u32(data, 20);

    let mut records = Vec::new();
    let mut offset = GLOBAL_HEADER_LEN;
    while offset < data.len() {
        let index = records.len();
        if data.len() - offset < RECORD_HEADER_LEN {
            return Err(PcapParseError::TruncatedRecord { index });
        }
        let ts_sec = le_u32(data, offset);
        let ts_usec = le_u32(data, offset + 4);
        let incl_len = le_u32(data, offset + 8) as usize;
        offset += RECORD_HEADER_LEN;
        if data.len() - offset < incl_len {
            return Err(PcapParseError::TruncatedRecord { index });
        }
        let timestamp = Utc
            .timestamp_opt(ts_sec as i64, ts_usec.saturating_mul(1000))
            .single()
            .unwrap_or_default();
        records.push(PacketRecord::new(
            timestamp,
            Direction::Sent,
            data[offset..offset + incl_len].to_vec(),
        ));
        offset += incl_len;
    }

    Ok(PcapCapture {
        snaplen,
        link_type,
        records,
    })
}

fn le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
