//! Flow identification and TCP segment synthesis
//!
//! Datagrams are parsed with etherparse. Every flow is keyed from the device's
//! point of view: `client` is the local endpoint, `server` the remote one, so
//! both directions of a connection map to the same [`FlowKey`].

use etherparse::{NetSlice, PacketBuilder, SlicedPacket, TransportSlice};
use std::io;
use std::net::{IpAddr, SocketAddr};

use crate::models::Direction;

/// Largest TCP payload placed in one synthesized segment
pub const SEGMENT_MSS: usize = 1360;

const SYNTHETIC_TTL: u8 = 64;
const SYNTHETIC_WINDOW: u16 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub transport: Transport,
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl FlowKey {
    /// Source and destination of a datagram travelling in `direction`
    pub fn endpoints(&self, direction: Direction) -> (SocketAddr, SocketAddr) {
        match direction {
            Direction::Sent => (self.client, self.server),
            Direction::Received => (self.server, self.client),
        }
    }
}

/// TCP header fields the TLS stage needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpInfo {
    pub fn closing(&self) -> bool {
        self.fin || self.rst
    }
}

#[derive(Debug, Clone)]
pub struct ParsedPacket<'a> {
    pub flow: FlowKey,
    pub tcp: Option<TcpInfo>,
    pub payload: &'a [u8],
}

/// Parse a raw IPv4/IPv6 datagram carrying TCP or UDP
///
/// Anything else (ICMP, fragments, truncated headers) yields `None` and is
/// captured as-is by the caller.
pub fn parse(data: &[u8], direction: Direction) -> Option<ParsedPacket<'_>> {
    let sliced = SlicedPacket::from_ip(data).ok()?;

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ip)) => (
            IpAddr::V4(ip.header().source_addr()),
            IpAddr::V4(ip.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ip)) => (
            IpAddr::V6(ip.header().source_addr()),
            IpAddr::V6(ip.header().destination_addr()),
        ),
        _ => return None,
    };

    let (transport, src_port, dst_port, tcp, payload) = match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => (
            Transport::Tcp,
            tcp.source_port(),
            tcp.destination_port(),
            Some(TcpInfo {
                seq: tcp.sequence_number(),
                ack: tcp.acknowledgment_number(),
                syn: tcp.syn(),
                fin: tcp.fin(),
                rst: tcp.rst(),
            }),
            tcp.payload(),
        ),
        Some(TransportSlice::Udp(udp)) => (
            Transport::Udp,
            udp.source_port(),
            udp.destination_port(),
            None,
            udp.payload(),
        ),
        _ => return None,
    };

    let src = SocketAddr::new(src_ip, src_port);
    let dst = SocketAddr::new(dst_ip, dst_port);
    let (client, server) = match direction {
        Direction::Sent => (src, dst),
        Direction::Received => (dst, src),
    };

    Some(ParsedPacket {
        flow: FlowKey {
            transport,
            client,
            server,
        },
        tcp,
        payload,
    })
}

/// Build an IP/TCP datagram with PSH|ACK set
pub fn build_tcp_segment(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    let builder = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            PacketBuilder::ipv4(s.octets(), d.octets(), SYNTHETIC_TTL)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            PacketBuilder::ipv6(s.octets(), d.octets(), SYNTHETIC_TTL)
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mixed address families in one flow",
            ))
        }
    };
    let builder = builder
        .tcp(src.port(), dst.port(), seq, SYNTHETIC_WINDOW)
        .ack(ack)
        .psh();

    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut out, payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(out)
}

/// Sequence bookkeeping for a flow whose TCP payload the TLS stage rewrites
///
/// The device and the remote server each see a byte stream produced by the
/// interceptor, so each leg gets its own sequence space. Decrypted records use
/// a third pair of spaces so the capture reads as one coherent cleartext
/// stream.
#[derive(Debug, Clone)]
pub struct SegmentState {
    to_client_seq: u32,
    to_client_ack: u32,
    to_server_seq: u32,
    to_server_ack: u32,
    plain_client_seq: u32,
    plain_server_seq: u32,
}

impl SegmentState {
    /// Seed from the first client segment carrying payload
    pub fn from_first_segment(tcp: &TcpInfo, payload_len: usize) -> Self {
        Self {
            to_client_seq: tcp.ack,
            to_client_ack: tcp.seq.wrapping_add(payload_len as u32),
            to_server_seq: tcp.seq,
            to_server_ack: tcp.ack,
            plain_client_seq: tcp.seq,
            plain_server_seq: tcp.ack,
        }
    }

    /// Trim a tunnel segment to the bytes not yet seen in its direction
    ///
    /// `None` when the segment carries nothing new: a pure ACK, a
    /// retransmission, or data beyond a gap. Accepted bytes advance the
    /// acknowledgement sent back to that peer.
    pub fn admit<'p>(
        &mut self,
        direction: Direction,
        tcp: &TcpInfo,
        payload: &'p [u8],
    ) -> Option<&'p [u8]> {
        let expected = match direction {
            Direction::Sent => &mut self.to_client_ack,
            Direction::Received => &mut self.to_server_ack,
        };
        // Signed distance in sequence space, wrapping at 2^32
        let behind = expected.wrapping_sub(tcp.seq) as i32;
        if behind < 0 || behind as usize >= payload.len() {
            return None;
        }
        *expected = tcp.seq.wrapping_add(payload.len() as u32);
        Some(&payload[behind as usize..])
    }

    /// Segments delivering `payload` to the device; an empty payload yields a pure ACK
    pub fn segments_to_client(&mut self, flow: &FlowKey, payload: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let (src, dst) = flow.endpoints(Direction::Received);
        segment_stream(src, dst, &mut self.to_client_seq, self.to_client_ack, payload)
    }

    /// Segments delivering `payload` to the remote server; an empty payload yields a pure ACK
    pub fn segments_to_server(&mut self, flow: &FlowKey, payload: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let (src, dst) = flow.endpoints(Direction::Sent);
        segment_stream(src, dst, &mut self.to_server_seq, self.to_server_ack, payload)
    }

    /// Datagram carrying decrypted bytes, framed for the capture
    pub fn plaintext_datagram(
        &mut self,
        flow: &FlowKey,
        direction: Direction,
        plaintext: &[u8],
    ) -> io::Result<Vec<u8>> {
        let (src, dst) = flow.endpoints(direction);
        let (seq, ack) = match direction {
            Direction::Sent => (&mut self.plain_client_seq, self.plain_server_seq),
            Direction::Received => (&mut self.plain_server_seq, self.plain_client_seq),
        };
        let datagram = build_tcp_segment(src, dst, *seq, ack, plaintext)?;
        *seq = seq.wrapping_add(plaintext.len() as u32);
        Ok(datagram)
    }
}

fn segment_stream(
    src: SocketAddr,
    dst: SocketAddr,
    seq: &mut u32,
    ack: u32,
    payload: &[u8],
) -> io::Result<Vec<Vec<u8>>> {
    if payload.is_empty() {
        return Ok(vec![build_tcp_segment(src, dst, *seq, ack, &[])?]);
    }
    let mut segments = Vec::with_capacity(payload.len().div_ceil(SEGMENT_MSS));
    for chunk in payload.chunks(SEGMENT_MSS) {
        segments.push(build_tcp_segment(src, dst, *seq, ack, chunk)?);
        *seq = seq.wrapping_add(chunk.len() as u32);
    }
    Ok(segments)
}
