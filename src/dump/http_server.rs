//! Pcap-over-HTTP backend
//!
//! Every TCP client that connects gets an HTTP response head and the pcap
//! global header, then a live stream of records until it disconnects. Each
//! client has a bounded queue; a client that cannot keep up is dropped instead
//! of slowing the capture path down.

use bytes::Bytes;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{pcap, DumpBackend};
use crate::error::{BackendInitError, BackendWriteError};
use crate::models::{DumpMode, PacketRecord};

/// Records buffered per client before it is considered too slow
const CLIENT_QUEUE_DEPTH: usize = 4096;

const RESPONSE_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: application/vnd.tcpdump.pcap\r\n\
Content-Disposition: attachment; filename=\"capture.pcap\"\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\r\n";

type ClientMap = DashMap<u64, mpsc::Sender<Bytes>>;

pub struct HttpServerBackend {
    local_addr: SocketAddr,
    snaplen: u32,
    clients: Arc<ClientMap>,
    shutdown: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl HttpServerBackend {
    /// Bind the listener and start accepting clients
    ///
    /// Port 0 binds an ephemeral port; [`HttpServerBackend::port`] reports
    /// the one actually bound.
    pub async fn bind(
        bind_address: &str,
        port: u16,
        snaplen: u32,
    ) -> Result<Self, BackendInitError> {
        let listener = TcpListener::bind((bind_address, port))
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::AddrInUse => BackendInitError::PortInUse(port),
                _ => BackendInitError::Bind {
                    addr: format!("{}:{}", bind_address, port),
                    source,
                },
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BackendInitError::Bind {
                addr: format!("{}:{}", bind_address, port),
                source,
            })?;

        tracing::info!("Pcap HTTP server listening on {}", local_addr);

        let clients: Arc<ClientMap> = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let preamble = {
            let mut head = RESPONSE_HEAD.to_vec();
            head.extend_from_slice(&pcap::global_header(snaplen));
            Bytes::from(head)
        };
        let accept_task = tokio::spawn(accept_loop(
            listener,
            clients.clone(),
            preamble,
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            snaplen,
            clients,
            shutdown: Some(shutdown_tx),
            accept_task: Some(accept_task),
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl DumpBackend for HttpServerBackend {
    fn mode(&self) -> DumpMode {
        DumpMode::HttpServer { port: self.port() }
    }

    fn write(&mut self, record: &PacketRecord) -> Result<(), BackendWriteError> {
        if self.clients.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(pcap::encode_record(record, self.snaplen));
        self.clients.retain(|id, tx| match tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Pcap client {} is too slow, disconnecting it", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Pcap client {}: {}", id, BackendWriteError::ClientDisconnected);
                false
            }
        });
        Ok(())
    }

    fn flush_and_close(&mut self) -> Result<(), BackendWriteError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        // Dropping the senders lets each client drain its queue and hang up
        self.clients.clear();
        tracing::info!("Pcap HTTP server on {} stopped", self.local_addr);
        Ok(())
    }
}

impl Drop for HttpServerBackend {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    clients: Arc<ClientMap>,
    preamble: Bytes,
    mut shutdown: oneshot::Receiver<()>,
) {
    let next_id = AtomicU64::new(1);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
                    // Queue the preamble before registering so it always comes first
                    if tx.try_send(preamble.clone()).is_err() {
                        continue;
                    }
                    clients.insert(id, tx);
                    tracing::info!("Pcap client {} connected from {}", id, peer);
                    tokio::spawn(serve_client(id, socket, rx));
                }
                Err(e) => tracing::error!("Pcap server accept error: {}", e),
            }
        }
    }
}

async fn serve_client(id: u64, socket: TcpStream, mut rx: mpsc::Receiver<Bytes>) {
    let (mut reader, mut writer) = socket.into_split();
    let mut discard = [0u8; 1024];
    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = writer.write_all(&chunk).await {
                        tracing::debug!("Pcap client {} write failed: {}", id, e);
                        break;
                    }
                }
                None => break,
            },
            // The request itself is ignored; reading only detects a hang-up
            read = reader.read(&mut discard) => match read {
                Ok(0) | Err(_) => {
                    tracing::info!("Pcap client {} disconnected", id);
                    break;
                }
                Ok(_) => {}
            },
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::Utc;
    use std::time::Duration;

    async fn read_preamble(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        let mut header = [0u8; pcap::GLOBAL_HEADER_LEN];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[0..4], &pcap::PCAP_MAGIC.to_le_bytes());
        buf
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_bind_on_same_port_reports_port_in_use() {
        let first = HttpServerBackend::bind("127.0.0.1", 0, 65535).await.unwrap();
        let second = HttpServerBackend::bind("127.0.0.1", first.port(), 65535).await;
        assert!(matches!(second, Err(BackendInitError::PortInUse(p)) if p == first.port()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnecting_client_does_not_affect_others() {
        let mut backend = HttpServerBackend::bind("127.0.0.1", 0, 65535).await.unwrap();
        let addr = format!("127.0.0.1:{}", backend.port());

        let mut stays = TcpStream::connect(&addr).await.unwrap();
        let head = read_preamble(&mut stays).await;
        assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 200 OK"));

        let mut leaves = TcpStream::connect(&addr).await.unwrap();
        read_preamble(&mut leaves).await;
        drop(leaves);
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..3u8 {
            let record = PacketRecord::new(Utc::now(), Direction::Sent, vec![i; 10]);
            backend.write(&record).unwrap();
        }

        for i in 0..3u8 {
            let mut rec = [0u8; pcap::RECORD_HEADER_LEN + 10];
            tokio::time::timeout(Duration::from_secs(2), stays.read_exact(&mut rec))
                .await
                .expect("record in time")
                .unwrap();
            assert_eq!(&rec[pcap::RECORD_HEADER_LEN..], &[i; 10]);
        }
        assert_eq!(backend.client_count(), 1);
        backend.flush_and_close().unwrap();
    }
}
