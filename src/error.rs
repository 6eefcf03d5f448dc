//! Error taxonomy for the capture engine

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced synchronously by `CaptureSession::start`
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture is already running")]
    AlreadyRunning,

    #[error("failed to initialize dump backend: {0}")]
    BackendInit(#[from] BackendInitError),

    #[error("TLS decryption setup failed: {0}")]
    TlsSetup(String),

    #[error("invalid capture configuration: {0}")]
    InvalidConfig(String),
}

/// A dump backend could not be brought up
#[derive(Debug, Error)]
pub enum BackendInitError {
    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to open pcap file {}: {source}", path.display())]
    FileOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid collector address: {0}")]
    InvalidCollector(String),
}

/// A record could not be written by the active backend
///
/// Only [`BackendWriteError::StorageLost`] ends a running session; every other
/// variant is counted and capture carries on.
#[derive(Debug, Error)]
pub enum BackendWriteError {
    #[error("I/O failure: {0}")]
    IoFailure(#[from] io::Error),

    #[error("destination unreachable: {0}")]
    DestinationUnreachable(io::Error),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("capture storage {} is gone", .0.display())]
    StorageLost(PathBuf),
}

impl BackendWriteError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, BackendWriteError::StorageLost(_))
    }
}

/// Per-flow TLS interception failure; the flow falls back to pass-through
#[derive(Debug, Error)]
pub enum TlsHandshakeError {
    #[error("first payload segment does not hold a complete ClientHello")]
    IncompleteClientHello,

    #[error("ClientHello carries no server name")]
    MissingServerName,

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("certificate forging failed: {0}")]
    CertificateForge(String),

    #[error("TLS protocol error: {0}")]
    Protocol(#[from] rustls::Error),

    #[error("TLS I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration could not be loaded
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for CaptureError {
    fn from(err: ConfigError) -> Self {
        CaptureError::InvalidConfig(err.to_string())
    }
}
