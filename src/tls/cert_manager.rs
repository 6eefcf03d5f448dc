use anyhow::{anyhow, Context};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};

use super::CertificateForge;
use crate::config::TlsDecryptionConfig;

const MAX_SERVER_CONFIG_CACHE: usize = 256;

const CA_CERT_FILE: &str = "capture_core_ca.pem";
const CA_KEY_FILE: &str = "capture_core_ca.key";

/// Certificate authority used to forge leaf certificates for intercepted flows
pub struct CertManager {
    storage_path: Option<PathBuf>,
    pub ca_cert_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_chain: Vec<CertificateDer<'static>>,
    server_configs: Mutex<ServerConfigCache>,
}

impl CertManager {
    /// Load the CA stored under `storage_path`, generating and persisting one if absent
    pub fn new(storage_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = storage_path.as_ref();
        let ca_cert_path = path.join(CA_CERT_FILE);
        let ca_key_path = path.join(CA_KEY_FILE);

        let mut manager = if ca_cert_path.exists() && ca_key_path.exists() {
            let ca_cert_pem =
                fs::read_to_string(&ca_cert_path).context("Failed to read CA certificate file")?;
            let ca_key_pem =
                fs::read_to_string(&ca_key_path).context("Failed to read CA key file")?;
            Self::from_pem(&ca_cert_pem, &ca_key_pem)?
        } else {
            let (ca_cert, ca_key) = Self::generate_root()?;
            let ca_cert_pem = ca_cert.pem();

            if !path.exists() {
                fs::create_dir_all(path).context("Failed to create cert storage directory")?;
            }
            fs::write(&ca_cert_path, &ca_cert_pem).context("Failed to write CA certificate")?;
            fs::write(&ca_key_path, ca_key.serialize_pem()).context("Failed to write CA key")?;
            tracing::info!("Generated capture CA in {}", path.display());

            Self::assemble(ca_cert, ca_key, ca_cert_pem)
        };
        manager.storage_path = Some(path.to_path_buf());
        Ok(manager)
    }

    /// Build from PEM encoded trust material supplied by the host application
    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> anyhow::Result<Self> {
        let ca_key = KeyPair::from_pem(ca_key_pem).context("Failed to parse CA key")?;
        let params = CertificateParams::from_ca_cert_pem(ca_cert_pem).context("Invalid CA PEM")?;
        let ca_cert = params
            .self_signed(&ca_key)
            .context("Failed to reconstruct CA certificate")?;
        Ok(Self::assemble(ca_cert, ca_key, ca_cert_pem.to_string()))
    }

    /// Inline PEM material wins over the storage directory
    pub fn from_config(config: &TlsDecryptionConfig) -> anyhow::Result<Self> {
        match (&config.ca_cert_pem, &config.ca_key_pem) {
            (Some(cert), Some(key)) => Self::from_pem(cert, key),
            (None, None) => Self::new(config.resolved_storage_path()),
            _ => Err(anyhow!("CA certificate and key must be configured together")),
        }
    }

    fn assemble(ca_cert: Certificate, ca_key: KeyPair, ca_cert_pem: String) -> Self {
        let ca_chain = vec![ca_cert.der().clone()];
        Self {
            storage_path: None,
            ca_cert_pem,
            ca_cert,
            ca_key,
            ca_chain,
            server_configs: Mutex::new(ServerConfigCache::new()),
        }
    }

    fn generate_root() -> anyhow::Result<(Certificate, KeyPair)> {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        let now = OffsetDateTime::now_utc();
        let date_str = format!(
            "{:04}-{:02}-{:02}",
            now.year(),
            now.month() as u8,
            now.day()
        );

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            format!("Capture Core CA ({}, {})", hostname, date_str),
        );
        dn.push(DnType::OrganizationName, "Capture Core");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365 * 10)).unwrap_or(now);

        let key_pair = KeyPair::generate().context("Failed to generate CA key")?;
        let cert = params
            .self_signed(&key_pair)
            .context("Failed to self-sign CA certificate")?;
        Ok((cert, key_pair))
    }

    /// Directory the CA was loaded from, if it came from disk
    pub fn storage_path(&self) -> Option<&Path> {
        self.storage_path.as_deref()
    }

    /// DER form of the CA, for trust stores that need to accept forged leaves
    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    pub fn server_config_for_host(&self, host: &str) -> anyhow::Result<Arc<ServerConfig>> {
        let cache_key = host.to_ascii_lowercase();
        {
            let mut cache = self
                .server_configs
                .lock()
                .map_err(|_| anyhow!("CertManager cache poisoned"))?;
            if let Some(cfg) = cache.get(&cache_key) {
                return Ok(cfg);
            }
        }

        let (cert_chain, key_der) = self.issue_leaf_cert(host)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key_der)
            .context("Failed to build TLS server config")?;

        let arc = Arc::new(config);
        let mut cache = self
            .server_configs
            .lock()
            .map_err(|_| anyhow!("CertManager cache poisoned"))?;
        cache.insert(cache_key, arc.clone());
        Ok(arc)
    }

    fn issue_leaf_cert(
        &self,
        host: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();

        if let Ok(ip) = IpAddr::from_str(host) {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            params.subject_alt_names = vec![SanType::DnsName(
                Ia5String::try_from(host)
                    .map_err(|_| anyhow!("Invalid hostname for certificate"))?,
            )];
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, "Capture Core Intercepted");
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Backdated to tolerate clock skew on the device
        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365)).unwrap_or(now);

        let key_pair = KeyPair::generate().context("Failed to generate leaf key")?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .context("Failed to sign leaf certificate")?;

        let mut chain = Vec::with_capacity(2);
        chain.push(cert.der().clone());
        chain.extend(self.ca_chain.iter().cloned());

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((chain, key))
    }
}

impl CertificateForge for CertManager {
    fn server_config_for_host(&self, host: &str) -> anyhow::Result<Arc<ServerConfig>> {
        CertManager::server_config_for_host(self, host)
    }
}

struct ServerConfigCache {
    map: HashMap<String, Arc<ServerConfig>>,
    order: VecDeque<String>,
}

impl ServerConfigCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<ServerConfig>> {
        let cfg = self.map.get(key)?.clone();
        self.promote(key);
        Some(cfg)
    }

    fn insert(&mut self, key: String, config: Arc<ServerConfig>) {
        self.map.insert(key.clone(), config);
        self.promote(&key);
        while self.order.len() > MAX_SERVER_CONFIG_CACHE {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn promote(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_ca_once_and_reuses_existing_files() {
        let dir = tempdir().unwrap();

        {
            let manager = CertManager::new(dir.path()).expect("initial creation");
            assert!(!manager.ca_cert_pem.is_empty());
            assert!(dir.path().join(CA_CERT_FILE).exists());
            assert_eq!(manager.storage_path(), Some(dir.path()));
        }

        let original_pem = fs::read_to_string(dir.path().join(CA_CERT_FILE)).unwrap();
        let manager_again = CertManager::new(dir.path()).expect("reuse existing");
        assert_eq!(manager_again.ca_cert_pem, original_pem);
    }

    #[test]
    fn inline_pem_takes_precedence_over_storage() {
        let dir = tempdir().unwrap();
        let source = CertManager::new(dir.path()).unwrap();
        let key_pem = fs::read_to_string(dir.path().join(CA_KEY_FILE)).unwrap();

        let config = TlsDecryptionConfig {
            enabled: true,
            ca_cert_pem: Some(source.ca_cert_pem.clone()),
            ca_key_pem: Some(key_pem),
            ca_storage_path: Some(dir.path().join("unused")),
            ..TlsDecryptionConfig::default()
        };
        let manager = CertManager::from_config(&config).unwrap();
        assert!(manager.storage_path().is_none());
        assert!(!dir.path().join("unused").exists());
    }

    #[test]
    fn forged_configs_are_cached_per_host() {
        let dir = tempdir().unwrap();
        let manager = CertManager::new(dir.path()).unwrap();

        let first = manager.server_config_for_host("Example.com").unwrap();
        let second = manager.server_config_for_host("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.server_config_for_host("192.0.2.7").is_ok());
        assert!(manager.server_config_for_host("bücher.example").is_err());
    }
}
