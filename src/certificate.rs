//! TLS material handling
//! Key and certificate bytes are read once and shared by every TLS listener

use crate::config::TlsFiles;
use crate::error::TlsError;
use once_cell::sync::OnceCell;
use rustls_pemfile::{certs, private_key};
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// PEM encoded key and certificate chain
#[derive(Clone)]
pub struct TlsMaterial {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
}

impl TlsMaterial {
    /// Build a rustls server config that only offers HTTP/1.1
    pub fn server_config(&self) -> Result<rustls::ServerConfig, TlsError> {
        let cert_chain = certs(&mut BufReader::new(self.cert.as_slice()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::Parse {
                what: "certificate",
                source,
            })?;

        if cert_chain.is_empty() {
            return Err(TlsError::NoCertificates);
        }

        let key = private_key(&mut BufReader::new(self.key.as_slice()))
            .map_err(|source| TlsError::Parse {
                what: "private key",
                source,
            })?
            .ok_or(TlsError::NoPrivateKey)?;

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .field("cert", &format_args!("<{} bytes>", self.cert.len()))
            .finish()
    }
}

/// Storage the key and certificate are read from
pub trait TlsSource: Send + Sync {
    fn load(&self) -> Result<TlsMaterial, TlsError>;
}

/// Reads key and certificate from two files
#[derive(Debug, Clone)]
pub struct FileTlsSource {
    files: TlsFiles,
}

impl FileTlsSource {
    pub fn new(files: TlsFiles) -> Self {
        Self { files }
    }
}

impl TlsSource for FileTlsSource {
    fn load(&self) -> Result<TlsMaterial, TlsError> {
        let key = fs::read(&self.files.key).map_err(|source| TlsError::Read {
            what: "private key",
            path: self.files.key.clone(),
            source,
        })?;
        let cert = fs::read(&self.files.cert).map_err(|source| TlsError::Read {
            what: "certificate",
            path: self.files.cert.clone(),
            source,
        })?;

        info!(
            key = %self.files.key.display(),
            cert = %self.files.cert.display(),
            "Loaded TLS key and certificate"
        );

        Ok(TlsMaterial { key, cert })
    }
}

/// Lazily loaded, process-wide TLS material
///
/// The source is consulted on first demand only. A failed load is not
/// cached, but it is fatal to startup anyway.
pub struct TlsMaterialCache {
    source: Option<Box<dyn TlsSource>>,
    acceptor: OnceCell<TlsAcceptor>,
}

impl TlsMaterialCache {
    pub fn new(source: Option<Box<dyn TlsSource>>) -> Self {
        Self {
            source,
            acceptor: OnceCell::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Whether key/certificate were configured at all
    pub fn is_configured(&self) -> bool {
        self.source.is_some()
    }

    /// Acceptor shared by all TLS and sniffing listeners
    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        self.acceptor
            .get_or_try_init(|| {
                let source = self.source.as_ref().ok_or(TlsError::NotConfigured)?;
                let material = source.load()?;
                Ok(TlsAcceptor::from(Arc::new(material.server_config()?)))
            })
            .cloned()
    }
}
