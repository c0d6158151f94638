//! TLS listener support.
//!
//! Server configs are expensive to build and identical across sessions,
//! so they are cached process-wide by certificate path: loaded once,
//! shared by every listener that names the same files.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;

static GLOBAL: Lazy<CertificateCache> = Lazy::new(CertificateCache::new);

/// Write-once-per-path cache of TLS server configurations.
pub struct CertificateCache {
    configs: Mutex<HashMap<PathBuf, Arc<ServerConfig>>>,
}

impl CertificateCache {
    pub fn new() -> Self {
        Self {
            configs: Mutex::new(HashMap::new()),
        }
    }

    pub fn acceptor_for(&self, cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
        {
            let configs = self.configs.lock();
            if let Some(config) = configs.get(cert_path) {
                return Ok(TlsAcceptor::from(config.clone()));
            }
        }
        let config = Arc::new(load_server_config(cert_path, key_path)?);
        let mut configs = self.configs.lock();
        let entry = configs
            .entry(cert_path.to_path_buf())
            .or_insert(config)
            .clone();
        Ok(TlsAcceptor::from(entry))
    }
}

impl Default for CertificateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Acceptor from the process-wide cache.
pub fn acceptor_for(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    GLOBAL.acceptor_for(cert_path, key_path)
}

fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("opening certificate {}", cert_path.display()))?,
    );
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut cert_reader)
        .context("reading certificate chain")?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        bail!("no certificates in {}", cert_path.display());
    }

    let key = load_private_key(key_path)?;

    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")
}

fn load_private_key(key_path: &Path) -> Result<PrivateKey> {
    let open = || -> Result<BufReader<File>> {
        Ok(BufReader::new(File::open(key_path).with_context(|| {
            format!("opening private key {}", key_path.display())
        })?))
    };

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open()?)
        .context("reading pkcs8 private keys")?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open()?)
            .context("reading rsa private keys")?;
    }
    match keys.into_iter().next() {
        Some(key) => Ok(PrivateKey(key)),
        None => bail!("no private key in {}", key_path.display()),
    }
}
