use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use crate::capture::CaptureHandle;
use crate::models::{CaptureState, DumpMode, VpnStats};

/// Snapshot rendered by the status screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub is_running: bool,
    pub stats: VpnStats,
    /// Total traffic while running, "Ready" otherwise
    pub headline: String,
    /// Where the capture goes (running) or which mode is selected (ready)
    pub dump_info: String,
}

/// Build the status summary shown to the user
///
/// `tls_configured` reflects the host's TLS decryption preference, which is
/// only mentioned while the session is idle.
pub fn capture_status(handle: &CaptureHandle, tls_configured: bool) -> CaptureStatus {
    let state = handle.state();
    let is_running = state == CaptureState::Running;
    let stats = handle.stats();
    let mode = handle.current_dump_mode();

    let headline = if is_running {
        format_bytes(stats.total_bytes())
    } else {
        "Ready".to_string()
    };

    let dump_info = if is_running {
        running_dump_info(&mode)
    } else {
        let mut info = format!("Dump mode: {}", mode.kind());
        if tls_configured {
            info.push_str(" (with TLS decryption)");
        }
        info
    };

    CaptureStatus {
        state,
        is_running,
        stats,
        headline,
        dump_info,
    }
}

fn running_dump_info(mode: &DumpMode) -> String {
    match mode {
        DumpMode::HttpServer { port } => format!("http://{}:{}", local_ip_address(), port),
        DumpMode::UdpExporter { host, port } => format!("{}:{}", host, port),
        DumpMode::PcapFile { path } => path.display().to_string(),
        DumpMode::None => String::new(),
    }
}

/// Human readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let value = bytes as f64;
    if value < KB {
        format!("{} B", bytes)
    } else if value < MB {
        format!("{:.1} KB", value / KB)
    } else if value < GB {
        format!("{:.1} MB", value / MB)
    } else {
        format!("{:.1} GB", value / GB)
    }
}

/// Address other hosts on the LAN can reach this device at
///
/// Connecting a UDP socket sends nothing; it only asks the OS which local
/// address routes outward. Falls back to loopback when offline.
pub fn local_ip_address() -> IpAddr {
    let discover = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
        Ok(socket.local_addr()?.ip())
    };
    discover().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSession;
    use crate::config::CaptureConfig;
    use crate::dump::NullBackend;
    use crate::models::{DumpModeKind, RawPacket};
    use crate::platform::NoopInterface;
    use std::sync::Arc;

    #[test]
    fn formats_byte_counts() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn ready_status_names_the_configured_mode() {
        let session = CaptureSession::new(Arc::new(NoopInterface::new()));
        session.configure(CaptureConfig {
            dump_mode: DumpModeKind::UdpExporter,
            ..CaptureConfig::default()
        });

        let status = capture_status(&session.handle(), true);
        assert!(!status.is_running);
        assert_eq!(status.headline, "Ready");
        assert_eq!(status.dump_info, "Dump mode: UDP exporter (with TLS decryption)");

        let plain = capture_status(&session.handle(), false);
        assert_eq!(plain.dump_info, "Dump mode: UDP exporter");
    }

    #[tokio::test]
    async fn running_status_shows_traffic_and_destination() {
        let session = CaptureSession::new(Arc::new(NoopInterface::new()));
        session
            .start_with_backend(CaptureConfig::default(), Box::new(NullBackend::new()))
            .await
            .unwrap();
        session.ingest(RawPacket::sent(vec![0; 2048]));

        let status = capture_status(&session.handle(), false);
        assert!(status.is_running);
        assert_eq!(status.headline, "2.0 KB");
        assert_eq!(status.dump_info, "");

        assert_eq!(
            running_dump_info(&DumpMode::UdpExporter {
                host: "10.0.0.5".into(),
                port: 1234
            }),
            "10.0.0.5:1234"
        );
        assert!(running_dump_info(&DumpMode::HttpServer { port: 8080 }).ends_with(":8080"));
        assert_eq!(
            running_dump_info(&DumpMode::PcapFile {
                path: "/data/capture.pcap".into()
            }),
            "/data/capture.pcap"
        );
        session.stop();
    }
}
