//! Capture configuration
//!
//! The configuration is owned and persisted by the host application; the core
//! only reads it when a session is configured or started.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::{DumpMode, DumpModeKind};

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_COLLECTOR_PORT: u16 = 1234;
const DEFAULT_SNAPLEN: u32 = 65535;

/// Everything a capture session needs to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Selected dump backend
    pub dump_mode: DumpModeKind,
    /// Address the HTTP server backend binds to
    pub http_bind_address: String,
    /// Port the HTTP server backend binds to (0 picks a free port)
    pub http_server_port: u16,
    /// Collector host for the UDP exporter
    pub collector_host: String,
    /// Collector port for the UDP exporter
    pub collector_port: u16,
    /// Target file for the pcap file backend
    pub pcap_file_path: PathBuf,
    /// Maximum bytes stored per pcap record
    pub snaplen: u32,
    /// Period of the statistics notification
    pub stats_interval_ms: u64,
    /// Period of pcap file flushes during capture
    pub pcap_flush_interval_ms: u64,
    pub tls_decryption: TlsDecryptionConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dump_mode: DumpModeKind::None,
            http_bind_address: "0.0.0.0".to_string(),
            http_server_port: DEFAULT_HTTP_PORT,
            collector_host: "127.0.0.1".to_string(),
            collector_port: DEFAULT_COLLECTOR_PORT,
            pcap_file_path: PathBuf::from("capture.pcap"),
            snaplen: DEFAULT_SNAPLEN,
            stats_interval_ms: 1000,
            pcap_flush_interval_ms: 1000,
            tls_decryption: TlsDecryptionConfig::default(),
        }
    }
}

/// TLS interception switch and the trust material used to forge certificates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsDecryptionConfig {
    pub enabled: bool,
    /// PEM encoded CA certificate; takes precedence over `ca_storage_path`
    pub ca_cert_pem: Option<String>,
    /// PEM encoded CA private key, required together with `ca_cert_pem`
    pub ca_key_pem: Option<String>,
    /// Directory holding (or receiving) a generated CA
    pub ca_storage_path: Option<PathBuf>,
    /// Server ports whose flows are treated as TLS
    pub intercept_ports: Vec<u16>,
}

impl Default for TlsDecryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert_pem: None,
            ca_key_pem: None,
            ca_storage_path: None,
            intercept_ports: vec![443],
        }
    }
}

impl TlsDecryptionConfig {
    /// Directory used when no inline PEM material is configured
    pub fn resolved_storage_path(&self) -> PathBuf {
        self.ca_storage_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("capture_core")
        })
    }
}

impl CaptureConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CaptureConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snaplen == 0 {
            return Err(ConfigError::Invalid("snaplen must be positive".into()));
        }
        if self.stats_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "stats_interval_ms must be positive".into(),
            ));
        }
        match self.dump_mode {
            DumpModeKind::UdpExporter if self.collector_host.trim().is_empty() => {
                return Err(ConfigError::Invalid("collector_host cannot be empty".into()));
            }
            DumpModeKind::PcapFile if self.pcap_file_path.as_os_str().is_empty() => {
                return Err(ConfigError::Invalid("pcap_file_path cannot be empty".into()));
            }
            _ => {}
        }
        let tls = &self.tls_decryption;
        if tls.enabled && tls.ca_cert_pem.is_some() != tls.ca_key_pem.is_some() {
            return Err(ConfigError::Invalid(
                "ca_cert_pem and ca_key_pem must be provided together".into(),
            ));
        }
        Ok(())
    }

    /// Dump mode described by this configuration
    pub fn dump_mode(&self) -> DumpMode {
        match self.dump_mode {
            DumpModeKind::None => DumpMode::None,
            DumpModeKind::PcapFile => DumpMode::PcapFile {
                path: self.pcap_file_path.clone(),
            },
            DumpModeKind::HttpServer => DumpMode::HttpServer {
                port: self.http_server_port,
            },
            DumpModeKind::UdpExporter => DumpMode::UdpExporter {
                host: self.collector_host.clone(),
                port: self.collector_port,
            },
        }
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn pcap_flush_interval(&self) -> Duration {
        Duration::from_millis(self.pcap_flush_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.json");
        fs::write(
            &path,
            r#"{ "dump_mode": "udp_exporter", "collector_host": "10.0.0.2" }"#,
        )
        .unwrap();

        let config = CaptureConfig::load(&path).expect("load config");
        assert_eq!(config.http_server_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.tls_decryption.intercept_ports, vec![443]);
        assert_eq!(
            config.dump_mode(),
            DumpMode::UdpExporter {
                host: "10.0.0.2".into(),
                port: DEFAULT_COLLECTOR_PORT
            }
        );
    }

    #[test]
    fn rejects_half_configured_trust_material() {
        let mut config = CaptureConfig::default();
        config.tls_decryption.enabled = true;
        config.tls_decryption.ca_cert_pem = Some("-----BEGIN CERTIFICATE-----".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_empty_collector_host() {
        let config = CaptureConfig {
            dump_mode: DumpModeKind::UdpExporter,
            collector_host: "  ".into(),
            ..CaptureConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
