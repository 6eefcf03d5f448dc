//! Dump mode selection

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Where captured packets go for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DumpMode {
    #[default]
    None,
    PcapFile { path: PathBuf },
    HttpServer { port: u16 },
    UdpExporter { host: String, port: u16 },
}

impl DumpMode {
    pub fn kind(&self) -> DumpModeKind {
        match self {
            DumpMode::None => DumpModeKind::None,
            DumpMode::PcapFile { .. } => DumpModeKind::PcapFile,
            DumpMode::HttpServer { .. } => DumpModeKind::HttpServer,
            DumpMode::UdpExporter { .. } => DumpModeKind::UdpExporter,
        }
    }

    pub fn http_port(&self) -> Option<u16> {
        match self {
            DumpMode::HttpServer { port } => Some(*port),
            _ => None,
        }
    }

    pub fn collector(&self) -> Option<(String, u16)> {
        match self {
            DumpMode::UdpExporter { host, port } => Some((host.clone(), *port)),
            _ => None,
        }
    }
}

/// Dump mode without its parameters, as stored in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpModeKind {
    #[default]
    None,
    PcapFile,
    HttpServer,
    UdpExporter,
}

impl DumpModeKind {
    /// Human readable name shown by the status view
    pub fn label(&self) -> &'static str {
        match self {
            DumpModeKind::None => "No dump",
            DumpModeKind::PcapFile => "PCAP file",
            DumpModeKind::HttpServer => "HTTP server",
            DumpModeKind::UdpExporter => "UDP exporter",
        }
    }
}

impl fmt::Display for DumpModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
