//! TLS decryption stage

pub mod cert_manager;
pub mod decryptor;

pub use cert_manager::CertManager;
pub use decryptor::{build_upstream_client_config, Interception, TlsDecryptor, TlsVerdict};

use rustls::ServerConfig;
use std::sync::Arc;

/// Produces the server-side TLS configuration presented to the device for `host`
///
/// Implemented by [`CertManager`]; hosts embedding the core can supply their
/// own trust material through this trait instead.
pub trait CertificateForge: Send + Sync {
    fn server_config_for_host(&self, host: &str) -> anyhow::Result<Arc<ServerConfig>>;
}
