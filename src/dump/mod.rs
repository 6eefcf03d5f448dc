//! Dump backends
//!
//! Exactly one backend is active per capture session. It is selected from the
//! configuration at start time, owned by the session while running, and never
//! swapped mid-session.

pub mod file;
pub mod http_server;
pub mod null;
pub mod pcap;
pub mod udp_exporter;

pub use file::PcapFileBackend;
pub use http_server::HttpServerBackend;
pub use null::NullBackend;
pub use udp_exporter::{ExportReassembler, UdpExporterBackend};

use crate::config::CaptureConfig;
use crate::error::{BackendInitError, BackendWriteError};
use crate::models::{DumpModeKind, DumpMode, PacketRecord};

/// Consumer of captured packet records
///
/// `write` runs on the capture path and must never block for long: network
/// backends queue or send without waiting on their peers.
pub trait DumpBackend: Send {
    /// Live configuration of the backend (e.g. the port actually bound)
    fn mode(&self) -> DumpMode;

    fn write(&mut self, record: &PacketRecord) -> Result<(), BackendWriteError>;

    /// Push buffered data towards its destination
    fn flush(&mut self) -> Result<(), BackendWriteError> {
        Ok(())
    }

    /// Flush and release every resource; later writes fail
    fn flush_and_close(&mut self) -> Result<(), BackendWriteError>;
}

/// Initialize the backend selected by `config`
pub async fn open_backend(config: &CaptureConfig) -> Result<Box<dyn DumpBackend>, BackendInitError> {
    let backend: Box<dyn DumpBackend> = match config.dump_mode {
        DumpModeKind::None => Box::new(NullBackend::new()),
        DumpModeKind::PcapFile => Box::new(PcapFileBackend::create(
            &config.pcap_file_path,
            config.snaplen,
        )?),
        DumpModeKind::HttpServer => Box::new(
            HttpServerBackend::bind(
                &config.http_bind_address,
                config.http_server_port,
                config.snaplen,
            )
            .await?,
        ),
        DumpModeKind::UdpExporter => Box::new(UdpExporterBackend::connect(
            &config.collector_host,
            config.collector_port,
        )?),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn opens_the_configured_backend() {
        let dir = tempdir().unwrap();
        let config = CaptureConfig {
            dump_mode: DumpModeKind::PcapFile,
            pcap_file_path: dir.path().join("x.pcap"),
            ..CaptureConfig::default()
        };
        let mut backend = open_backend(&config).await.unwrap();
        assert_eq!(
            backend.mode(),
            DumpMode::PcapFile {
                path: dir.path().join("x.pcap")
            }
        );
        backend.flush_and_close().unwrap();

        let none = open_backend(&CaptureConfig::default()).await.unwrap();
        assert_eq!(none.mode(), DumpMode::None);
    }
}
