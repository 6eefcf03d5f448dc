//! Per-flow TLS interception
//!
//! The decryptor never touches a socket. It is fed the TCP payload of each
//! segment of an eligible flow and answers with the bytes to hand to the device
//! (`to_client`), the bytes to send to the real server (`to_server`) and the
//! cleartext recovered from the segment. The device talks to a forged
//! certificate; the real server is reached through a regular rustls client.

use rustls::pki_types::ServerName;
use rustls::server::Acceptor;
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use webpki_roots::TLS_SERVER_ROOTS;

use super::CertificateForge;
use crate::capture::flow::{FlowKey, Transport};
use crate::error::TlsHandshakeError;
use crate::models::Direction;

/// Upper bound on flows remembered as pass-through before they are forgotten
const MAX_PASSTHROUGH_FLOWS: usize = 4096;

/// Client configuration used towards real servers, trusting the web PKI
pub fn build_upstream_client_config() -> ClientConfig {
    let root_store = RootCertStore::from_iter(TLS_SERVER_ROOTS.iter().cloned());
    ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Outcome of feeding one segment payload to the decryptor
#[derive(Debug)]
pub enum TlsVerdict {
    /// The flow is not eligible for interception
    NotTls,
    /// Eligible, but left untouched; capture the original datagram
    PassThrough,
    /// The flow is terminated locally
    Intercepted(Interception),
}

#[derive(Debug, Default)]
pub struct Interception {
    pub host: String,
    /// Cleartext travelling in the direction of the fed segment
    pub plaintext: Vec<u8>,
    /// TLS bytes for the device
    pub to_client: Vec<u8>,
    /// TLS bytes for the real server
    pub to_server: Vec<u8>,
}

enum FlowTls {
    PassThrough,
    Intercepting(Box<Legs>),
}

struct Legs {
    host: String,
    /// Session with the device, presenting the forged certificate
    downstream: Connection,
    /// Session with the real server
    upstream: Connection,
}

pub struct TlsDecryptor {
    forge: Arc<dyn CertificateForge>,
    upstream_config: Arc<ClientConfig>,
    intercept_ports: Vec<u16>,
    flows: HashMap<FlowKey, FlowTls>,
}

impl TlsDecryptor {
    pub fn new(
        forge: Arc<dyn CertificateForge>,
        upstream_config: Arc<ClientConfig>,
        intercept_ports: Vec<u16>,
    ) -> Self {
        Self {
            forge,
            upstream_config,
            intercept_ports,
            flows: HashMap::new(),
        }
    }

    pub fn is_eligible(&self, flow: &FlowKey) -> bool {
        flow.transport == Transport::Tcp && self.intercept_ports.contains(&flow.server.port())
    }

    pub fn is_intercepted(&self, flow: &FlowKey) -> bool {
        matches!(self.flows.get(flow), Some(FlowTls::Intercepting(_)))
    }

    pub fn intercepted_flows(&self) -> usize {
        self.flows
            .values()
            .filter(|f| matches!(f, FlowTls::Intercepting(_)))
            .count()
    }

    /// Forget a flow; returns whether it was being intercepted
    pub fn close_flow(&mut self, flow: &FlowKey) -> bool {
        matches!(self.flows.remove(flow), Some(FlowTls::Intercepting(_)))
    }

    pub fn clear(&mut self) {
        self.flows.clear();
    }

    /// Feed the TCP payload of one segment
    ///
    /// An error means the flow could not be (or can no longer be) intercepted;
    /// it is remembered as pass-through and later segments yield
    /// [`TlsVerdict::PassThrough`].
    pub fn process(
        &mut self,
        flow: &FlowKey,
        direction: Direction,
        payload: &[u8],
    ) -> Result<TlsVerdict, TlsHandshakeError> {
        if !self.is_eligible(flow) {
            return Ok(TlsVerdict::NotTls);
        }

        match self.flows.get_mut(flow) {
            Some(FlowTls::PassThrough) => Ok(TlsVerdict::PassThrough),
            Some(FlowTls::Intercepting(legs)) => match relay(legs, direction, payload) {
                Ok(interception) => Ok(TlsVerdict::Intercepted(interception)),
                Err(err) => {
                    tracing::warn!("TLS relay for {} failed: {}", legs.host, err);
                    self.flows.insert(*flow, FlowTls::PassThrough);
                    Err(err)
                }
            },
            // Handshake segments and server data before the ClientHello are left alone
            None if direction == Direction::Received || payload.is_empty() => {
                Ok(TlsVerdict::PassThrough)
            }
            None => match self.begin(payload) {
                Ok((legs, interception)) => {
                    tracing::debug!("Intercepting TLS flow {} -> {}", flow.client, legs.host);
                    self.flows.insert(*flow, FlowTls::Intercepting(Box::new(legs)));
                    Ok(TlsVerdict::Intercepted(interception))
                }
                Err(err) => {
                    tracing::info!(
                        "TLS interception of {} skipped, passing through: {}",
                        flow.server,
                        err
                    );
                    self.remember_passthrough(*flow);
                    Err(err)
                }
            },
        }
    }

    fn remember_passthrough(&mut self, flow: FlowKey) {
        if self.flows.len() >= MAX_PASSTHROUGH_FLOWS {
            self.flows.retain(|_, f| matches!(f, FlowTls::Intercepting(_)));
        }
        self.flows.insert(flow, FlowTls::PassThrough);
    }

    /// Terminate the ClientHello locally and open the upstream leg
    fn begin(&self, client_hello: &[u8]) -> Result<(Legs, Interception), TlsHandshakeError> {
        let mut acceptor = Acceptor::default();
        let mut input = client_hello;
        while !input.is_empty() {
            if acceptor.read_tls(&mut input)? == 0 {
                break;
            }
        }
        let accepted = match acceptor.accept() {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return Err(TlsHandshakeError::IncompleteClientHello),
            Err((err, _alert)) => return Err(err.into()),
        };

        let host = accepted
            .client_hello()
            .server_name()
            .map(str::to_string)
            .ok_or(TlsHandshakeError::MissingServerName)?;
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| TlsHandshakeError::InvalidServerName(host.clone()))?;

        let forged = self
            .forge
            .server_config_for_host(&host)
            .map_err(|e| TlsHandshakeError::CertificateForge(e.to_string()))?;
        let downstream = accepted
            .into_connection(forged)
            .map_err(|(err, _alert)| TlsHandshakeError::Protocol(err))?;
        let upstream = ClientConnection::new(self.upstream_config.clone(), server_name)?;

        let mut legs = Legs {
            host,
            downstream: Connection::Server(downstream),
            upstream: Connection::Client(upstream),
        };
        let interception = Interception {
            host: legs.host.clone(),
            plaintext: Vec::new(),
            to_client: pending_tls(&mut legs.downstream)?,
            to_server: pending_tls(&mut legs.upstream)?,
        };
        Ok((legs, interception))
    }
}

/// Move one segment through the two legs
fn relay(
    legs: &mut Legs,
    direction: Direction,
    payload: &[u8],
) -> Result<Interception, TlsHandshakeError> {
    let plaintext = match direction {
        Direction::Sent => {
            let plaintext = absorb(&mut legs.downstream, payload)?;
            legs.upstream.writer().write_all(&plaintext)?;
            plaintext
        }
        Direction::Received => {
            let plaintext = absorb(&mut legs.upstream, payload)?;
            legs.downstream.writer().write_all(&plaintext)?;
            plaintext
        }
    };
    Ok(Interception {
        host: legs.host.clone(),
        plaintext,
        to_client: pending_tls(&mut legs.downstream)?,
        to_server: pending_tls(&mut legs.upstream)?,
    })
}

/// Feed TLS bytes into a connection and collect the cleartext they carry
fn absorb(conn: &mut Connection, mut data: &[u8]) -> Result<Vec<u8>, TlsHandshakeError> {
    let mut plaintext = Vec::new();
    while !data.is_empty() {
        if conn.read_tls(&mut data)? == 0 {
            break;
        }
        conn.process_new_packets()?;
        match conn.reader().read_to_end(&mut plaintext) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(plaintext)
}

fn pending_tls(conn: &mut Connection) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut out)?;
    }
    Ok(out)
}
