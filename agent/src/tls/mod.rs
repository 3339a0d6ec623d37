//! Automatic TLS certificates
//!
//! Keeps `(server.crt, server.key)` on disk valid for localhost plus every
//! non-loopback IPv4 address the machine currently holds. A local CA is
//! bootstrapped once and reused, so clients only need to trust one root;
//! leaves are reminted whenever the host set changes. mDNS hands mobile
//! clients a LAN IP, and the certificate must cover it or their connection
//! fails.

pub mod watcher;

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub const CERT_FILE: &str = "server.crt";
pub const KEY_FILE: &str = "server.key";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";
const HOSTS_FILE: &str = "hosts";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("bad PEM material: {0}")]
    Pem(String),
}

pub struct TlsManager {
    dir: PathBuf,
}

impl TlsManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Hosts the certificate must cover right now: localhost, 127.0.0.1 and
    /// every non-loopback IPv4 interface address.
    pub fn current_hosts() -> Vec<String> {
        let mut hosts = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        if let Ok(interfaces) = if_addrs::get_if_addrs() {
            for iface in interfaces {
                if iface.is_loopback() {
                    continue;
                }
                if let IpAddr::V4(ip) = iface.ip() {
                    hosts.push(ip.to_string());
                }
            }
        }
        hosts
    }

    /// Make the on-disk certificate cover `hosts`. Regenerates when the
    /// cert or key is missing or the persisted host set differs (set
    /// equality, order-insensitive). Returns whether a new leaf was minted.
    pub fn ensure(&self, hosts: &[String]) -> Result<bool, TlsError> {
        let wanted: BTreeSet<String> = hosts.iter().cloned().collect();
        let cert_path = self.dir.join(CERT_FILE);
        let key_path = self.dir.join(KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            if let Some(cached) = self.cached_hosts() {
                if cached == wanted {
                    return Ok(false);
                }
            }
        }

        std::fs::create_dir_all(&self.dir).map_err(|source| TlsError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let (ca_cert, ca_key) = self.bootstrap_ca()?;

        let mut params = CertificateParams::new(hosts.to_vec())?;
        params
            .distinguished_name
            .push(DnType::CommonName, "nfc-agent");
        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

        write_atomic(&cert_path, leaf.pem().as_bytes())?;
        write_atomic(&key_path, leaf_key.serialize_pem().as_bytes())?;
        let mut host_lines: Vec<&str> = wanted.iter().map(String::as_str).collect();
        host_lines.sort_unstable();
        write_atomic(&self.dir.join(HOSTS_FILE), host_lines.join("\n").as_bytes())?;

        info!(
            hosts = %host_lines.join(", "),
            fingerprint = %self.ca_fingerprint()?,
            "minted TLS certificate"
        );
        Ok(true)
    }

    fn cached_hosts(&self) -> Option<BTreeSet<String>> {
        let raw = std::fs::read_to_string(self.dir.join(HOSTS_FILE)).ok()?;
        Some(
            raw.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Load the CA, creating it on first use.
    fn bootstrap_ca(&self) -> Result<(Certificate, KeyPair), TlsError> {
        let cert_path = self.dir.join(CA_CERT_FILE);
        let key_path = self.dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let key_pem = read_to_string(&key_path)?;
            let cert_pem = read_to_string(&cert_path)?;
            let key = KeyPair::from_pem(&key_pem)?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
            let cert = params.self_signed(&key)?;
            return Ok((cert, key));
        }

        let mut params = CertificateParams::new(Vec::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "nfc-agent local CA");
        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        write_atomic(&cert_path, cert.pem().as_bytes())?;
        write_atomic(&key_path, key.serialize_pem().as_bytes())?;
        info!(path = %cert_path.display(), "bootstrapped local CA");
        Ok((cert, key))
    }

    /// SHA-256 fingerprint of the CA certificate, colon-separated.
    pub fn ca_fingerprint(&self) -> Result<String, TlsError> {
        let der = CertificateDer::from_pem_file(self.dir.join(CA_CERT_FILE))
            .map_err(|e| TlsError::Pem(e.to_string()))?;
        let digest = Sha256::digest(der.as_ref());
        Ok(digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":"))
    }

    /// Build a server config from the on-disk leaf.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let certs: Vec<CertificateDer<'static>> =
            CertificateDer::pem_file_iter(self.dir.join(CERT_FILE))
                .map_err(|e| TlsError::Pem(e.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|e| TlsError::Pem(e.to_string()))?;
        let key = PrivateKeyDer::from_pem_file(self.dir.join(KEY_FILE))
            .map_err(|e| TlsError::Pem(e.to_string()))?;
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }
}

fn read_to_string(path: &Path) -> Result<String, TlsError> {
    std::fs::read_to_string(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write via a temp file and rename, so servers never read a half-written
/// cert.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TlsError> {
    let tmp = path.with_extension("tmp");
    let io_err = |source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn mints_and_reuses_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());

        let set = hosts(&["localhost", "127.0.0.1", "10.0.0.5"]);
        assert!(manager.ensure(&set).unwrap(), "first run must mint");
        assert!(dir.path().join(CERT_FILE).exists());
        assert!(dir.path().join(KEY_FILE).exists());
        assert!(dir.path().join(CA_CERT_FILE).exists());

        assert!(!manager.ensure(&set).unwrap(), "same set must not remint");
    }

    #[test]
    fn host_set_comparison_is_order_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());
        assert!(manager.ensure(&hosts(&["localhost", "10.0.0.5"])).unwrap());
        assert!(!manager.ensure(&hosts(&["10.0.0.5", "localhost"])).unwrap());
    }

    #[test]
    fn address_change_rotates_the_leaf_but_not_the_ca() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());

        manager
            .ensure(&hosts(&["localhost", "127.0.0.1", "10.0.0.5"]))
            .unwrap();
        let first_leaf = std::fs::read(dir.path().join(CERT_FILE)).unwrap();
        let fingerprint = manager.ca_fingerprint().unwrap();

        assert!(
            manager
                .ensure(&hosts(&["localhost", "127.0.0.1", "10.0.0.6"]))
                .unwrap(),
            "changed host set must remint"
        );
        let second_leaf = std::fs::read(dir.path().join(CERT_FILE)).unwrap();
        assert_ne!(first_leaf, second_leaf);
        assert_eq!(
            manager.ca_fingerprint().unwrap(),
            fingerprint,
            "CA must survive leaf rotation"
        );
    }

    #[test]
    fn missing_key_forces_regeneration() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());
        let set = hosts(&["localhost"]);
        manager.ensure(&set).unwrap();
        std::fs::remove_file(dir.path().join(KEY_FILE)).unwrap();
        assert!(manager.ensure(&set).unwrap());
    }

    #[test]
    fn server_config_loads_minted_material() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());
        manager.ensure(&hosts(&["localhost", "127.0.0.1"])).unwrap();
        let config = manager.server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn fingerprint_shape() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::new(dir.path());
        manager.ensure(&hosts(&["localhost"])).unwrap();
        let fp = manager.ca_fingerprint().unwrap();
        assert_eq!(fp.split(':').count(), 32);
        assert!(fp.split(':').all(|p| p.len() == 2));
    }
}
