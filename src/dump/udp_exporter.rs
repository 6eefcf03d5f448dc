//! UDP exporter backend
//!
//! Best-effort streaming to a remote collector. Every datagram is
//! self-contained: a 24-byte header followed by up to [`MAX_CHUNK_LEN`]
//! payload bytes. Records larger than that are split into fragments sharing
//! one record id.
//!
//! ```text
//! 0      2    3    4         8      10     12       16        20        24
//! | "CX" | v1 | dir| rec id  | frag | count| ts sec | ts usec | orig len | payload...
//! ```

use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use super::DumpBackend;
use crate::error::{BackendInitError, BackendWriteError};
use crate::models::{Direction, DumpMode, PacketRecord};

pub const EXPORT_MAGIC: [u8; 2] = *b"CX";
pub const EXPORT_VERSION: u8 = 1;
pub const EXPORT_HEADER_LEN: usize = 24;
/// Keeps every datagram within a 1400 byte budget
pub const MAX_CHUNK_LEN: usize = 1400 - EXPORT_HEADER_LEN;

/// Header of one exported datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportHeader {
    pub direction: Direction,
    pub record_id: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub original_len: u32,
}

impl ExportHeader {
    pub fn encode(&self) -> [u8; EXPORT_HEADER_LEN] {
        let mut out = [0u8; EXPORT_HEADER_LEN];
        out[0..2].copy_from_slice(&EXPORT_MAGIC);
        out[2] = EXPORT_VERSION;
        out[3] = self.direction.as_u8();
        out[4..8].copy_from_slice(&self.record_id.to_be_bytes());
        out[8..10].copy_from_slice(&self.fragment_index.to_be_bytes());
        out[10..12].copy_from_slice(&self.fragment_count.to_be_bytes());
        out[12..16].copy_from_slice(&self.ts_sec.to_be_bytes());
        out[16..20].copy_from_slice(&self.ts_usec.to_be_bytes());
        out[20..24].copy_from_slice(&self.original_len.to_be_bytes());
        out
    }

    /// Split a datagram into header and payload; `None` for foreign datagrams
    pub fn decode(datagram: &[u8]) -> Option<(ExportHeader, &[u8])> {
        if datagram.len() < EXPORT_HEADER_LEN
            || datagram[0..2] != EXPORT_MAGIC
            || datagram[2] != EXPORT_VERSION
        {
            return None;
        }
        let be_u16 = |at: usize| u16::from_be_bytes([datagram[at], datagram[at + 1]]);
        let be_u32 = |at: usize| {
            u32::from_be_bytes([
                datagram[at],
                datagram[at + 1],
                datagram[at + 2],
                datagram[at + 3],
            ])
        };
        let header = ExportHeader {
            direction: Direction::from_u8(datagram[3])?,
            record_id: be_u32(4),
            fragment_index: be_u16(8),
            fragment_count: be_u16(10),
            ts_sec: be_u32(12),
            ts_usec: be_u32(16),
            original_len: be_u32(20),
        };
        if header.fragment_count == 0 || header.fragment_index >= header.fragment_count {
            return None;
        }
        Some((header, &datagram[EXPORT_HEADER_LEN..]))
    }
}

/// Encode a record as one or more datagrams
pub fn encode_datagrams(record: &PacketRecord, record_id: u32) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = if record.payload.is_empty() {
        vec![&[][..]]
    } else {
        record.payload.chunks(MAX_CHUNK_LEN).collect()
    };
    let fragment_count = chunks.len().min(u16::MAX as usize) as u16;

    chunks
        .into_iter()
        .take(fragment_count as usize)
        .enumerate()
        .map(|(index, chunk)| {
            let header = ExportHeader {
                direction: record.direction,
                record_id,
                fragment_index: index as u16,
                fragment_count,
                ts_sec: record.ts_sec(),
                ts_usec: record.ts_usec(),
                original_len: record.payload.len() as u32,
            };
            let mut datagram = Vec::with_capacity(EXPORT_HEADER_LEN + chunk.len());
            datagram.extend_from_slice(&header.encode());
            datagram.extend_from_slice(chunk);
            datagram
        })
        .collect()
}

pub struct UdpExporterBackend {
    socket: UdpSocket,
    host: String,
    port: u16,
    collector: SocketAddr,
    next_record_id: u32,
    send_failures: u64,
}

impl UdpExporterBackend {
    /// Resolve the collector and open a non-blocking socket towards it
    pub fn connect(host: &str, port: u16) -> Result<Self, BackendInitError> {
        let collector = (host, port)
            .to_socket_addrs()
            .map_err(|e| BackendInitError::InvalidCollector(format!("{}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| {
                BackendInitError::InvalidCollector(format!("{}:{} did not resolve", host, port))
            })?;

        let local = if collector.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let bind_failed = |source| BackendInitError::Bind {
            addr: local.to_string(),
            source,
        };
        let socket = UdpSocket::bind(local).map_err(bind_failed)?;
        socket.set_nonblocking(true).map_err(bind_failed)?;
        // A connected socket gets ICMP unreachable reports back as send errors
        socket.connect(collector).map_err(|e| {
            BackendInitError::InvalidCollector(format!("{}: {}", collector, e))
        })?;

        tracing::info!("Exporting packets to collector {}", collector);
        Ok(Self {
            socket,
            host: host.to_string(),
            port,
            collector,
            next_record_id: 0,
            send_failures: 0,
        })
    }

    pub fn collector_addr(&self) -> SocketAddr {
        self.collector
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }
}

impl DumpBackend for UdpExporterBackend {
    fn mode(&self) -> DumpMode {
        DumpMode::UdpExporter {
            host: self.host.clone(),
            port: self.port,
        }
    }

    fn write(&mut self, record: &PacketRecord) -> Result<(), BackendWriteError> {
        let record_id = self.next_record_id;
        self.next_record_id = self.next_record_id.wrapping_add(1);

        for datagram in encode_datagrams(record, record_id) {
            if let Err(err) = self.socket.send(&datagram) {
                self.send_failures += 1;
                return Err(classify_send_error(err));
            }
        }
        Ok(())
    }

    fn flush_and_close(&mut self) -> Result<(), BackendWriteError> {
        tracing::info!(
            "UDP exporter to {} closed ({} failed sends)",
            self.collector,
            self.send_failures
        );
        Ok(())
    }
}

fn classify_send_error(err: io::Error) -> BackendWriteError {
    match err.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::AddrNotAvailable => {
            BackendWriteError::DestinationUnreachable(err)
        }
        _ => BackendWriteError::IoFailure(err),
    }
}

const MAX_PENDING_RECORDS: usize = 256;

/// Rebuilds records from exported datagrams on the collector side
///
/// Fragments may arrive in any order; incomplete records are evicted oldest
/// first once more than a bounded number are pending.
#[derive(Debug, Default)]
pub struct ExportReassembler {
    pending: HashMap<u32, PendingRecord>,
    order: VecDeque<u32>,
}

#[derive(Debug)]
struct PendingRecord {
    header: ExportHeader,
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl PendingRecord {
    /// Record ids wrap, so a reused id only continues a record with the same shape
    fn belongs_with(&self, header: &ExportHeader) -> bool {
        self.fragments.len() == header.fragment_count as usize
            && self.header.ts_sec == header.ts_sec
            && self.header.ts_usec == header.ts_usec
            && self.header.original_len == header.original_len
            && self.header.direction == header.direction
    }
}

impl ExportReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one datagram; returns a record once all its fragments are in
    pub fn push(&mut self, datagram: &[u8]) -> Option<PacketRecord> {
        let (header, chunk) = ExportHeader::decode(datagram)?;
        if header.fragment_count == 1 {
            return Some(to_record(&header, chunk.to_vec()));
        }

        let id = header.record_id;
        let expected = header.fragment_count as usize;
        let fresh = self
            .pending
            .get(&id)
            .map_or(true, |entry| !entry.belongs_with(&header));
        if fresh {
            self.pending.remove(&id);
            self.order.retain(|pending| *pending != id);
            self.evict();
            self.order.push_back(id);
            self.pending.insert(
                id,
                PendingRecord {
                    header,
                    fragments: vec![None; expected],
                    received: 0,
                },
            );
        }
        let entry = self.pending.get_mut(&id)?;

        let slot = &mut entry.fragments[header.fragment_index as usize];
        if slot.is_none() {
            *slot = Some(chunk.to_vec());
            entry.received += 1;
        }
        if entry.received < entry.fragments.len() {
            return None;
        }

        let done = self.pending.remove(&id)?;
        self.order.retain(|pending| *pending != id);
        let payload = done.fragments.into_iter().flatten().flatten().collect();
        Some(to_record(&done.header, payload))
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn evict(&mut self) {
        while self.order.len() >= MAX_PENDING_RECORDS {
            if let Some(oldest) = self.order.pop_front() {
                self.pending.remove(&oldest);
            }
        }
    }
}

fn to_record(header: &ExportHeader, payload: Vec<u8>) -> PacketRecord {
    let timestamp = Utc
        .timestamp_opt(header.ts_sec as i64, header.ts_usec.saturating_mul(1000))
        .single()
        .unwrap_or_default();
    PacketRecord::new(timestamp, header.direction, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_records_are_split_and_reassembled_in_any_order() {
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let record = PacketRecord::new(Utc::now(), Direction::Received, payload.clone());

        let mut datagrams = encode_datagrams(&record, 42);
        assert_eq!(datagrams.len(), 3);
        assert!(datagrams.iter().all(|d| d.len() <= 1400));

        datagrams.reverse();
        let mut reassembler = ExportReassembler::new();
        assert!(reassembler.push(&datagrams[0]).is_none());
        assert!(reassembler.push(&datagrams[1]).is_none());
        let rebuilt = reassembler.push(&datagrams[2]).expect("complete record");
        assert_eq!(rebuilt.payload, payload);
        assert_eq!(rebuilt.direction, Direction::Received);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn reused_record_id_does_not_mix_payloads() {
        let at = |secs| Utc.timestamp_opt(secs, 0).single().unwrap();
        let stale = PacketRecord::new(at(1_000), Direction::Sent, vec![0xaa; 2000]);
        let current = PacketRecord::new(at(2_000), Direction::Sent, vec![0xbb; 1500]);
        let stale = encode_datagrams(&stale, 5);
        let current = encode_datagrams(&current, 5);
        assert_eq!(stale.len(), 2);
        assert_eq!(current.len(), 2);

        let mut reassembler = ExportReassembler::new();
        assert!(reassembler.push(&stale[0]).is_none());
        assert!(reassembler.push(&current[1]).is_none());
        let rebuilt = reassembler.push(&current[0]).expect("complete record");
        assert_eq!(rebuilt.payload, vec![0xbb; 1500]);
        assert_eq!(rebuilt.ts_sec(), 2_000);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn foreign_datagrams_are_ignored() {
        let mut reassembler = ExportReassembler::new();
        assert!(reassembler.push(b"not an export datagram at all").is_none());
    }

    #[test]
    fn unreachable_collector_is_reported_but_not_fatal() {
        let port = {
            let vacant = UdpSocket::bind("127.0.0.1:0").unwrap();
            vacant.local_addr().unwrap().port()
        };
        let mut backend = UdpExporterBackend::connect("127.0.0.1", port).unwrap();

        let mut unreachable = 0;
        for _ in 0..50 {
            let record = PacketRecord::new(Utc::now(), Direction::Sent, vec![0u8; 64]);
            if let Err(BackendWriteError::DestinationUnreachable(_)) = backend.write(&record) {
                unreachable += 1;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(unreachable > 0, "ICMP port unreachable surfaces as a send error");
        assert!(backend.send_failures() >= unreachable);
        assert!(backend.flush_and_close().is_ok());
    }

    #[test]
    fn unresolvable_collector_fails_to_init() {
        let result = UdpExporterBackend::connect("collector.invalid", 1234);
        assert!(matches!(result, Err(BackendInitError::InvalidCollector(_))));
    }

    #[test]
    fn exported_datagrams_arrive_at_the_collector() {
        let collector = UdpSocket::bind("127.0.0.1:0").unwrap();
        collector
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let port = collector.local_addr().unwrap().port();

        let mut backend = UdpExporterBackend::connect("127.0.0.1", port).unwrap();
        let record = PacketRecord::new(Utc::now(), Direction::Sent, b"payload".to_vec());
        backend.write(&record).unwrap();

        let mut buf = [0u8; 1500];
        let n = collector.recv(&mut buf).unwrap();
        let rebuilt = ExportReassembler::new().push(&buf[..n]).unwrap();
        assert_eq!(rebuilt.payload, b"payload");
        assert_eq!(rebuilt.ts_sec(), record.ts_sec());
    }
}
