//! Error types
//!
//! Request-scoped failures (`RouteError`) never leave the proxy handler; they
//! become a 404 naming the backend. Everything else is a startup failure and
//! ends the process.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a single request could not be routed to its backend
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("request has no usable Host header")]
    MissingHost,

    #[error("invalid backend name in host {0:?}")]
    InvalidName(String),

    #[error("backend {name} did not resolve: {reason}")]
    Unresolved { name: String, reason: String },

    #[error("backend {name} not found at {}", path.display())]
    NotFound {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to backend {name}")]
    Connect {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("backend {name} protocol error")]
    Backend {
        name: String,
        #[source]
        source: hyper::Error,
    },
}

impl RouteError {
    /// Backend name the failure concerns, when one was parsed
    pub fn backend_name(&self) -> Option<&str> {
        match self {
            Self::MissingHost => None,
            Self::InvalidName(_) => None,
            Self::Unresolved { name, .. }
            | Self::NotFound { name, .. }
            | Self::Connect { name, .. }
            | Self::Backend { name, .. } => Some(name),
        }
    }
}

/// Render an error and its sources as `outer: inner: ...`
pub fn display_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Invalid configuration, detected before anything is bound
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("port list must not be empty")]
    NoPorts,

    #[error("invalid tunnel {0:?}, expected <subdomain>.<relay host>")]
    InvalidTunnel(String),

    #[error("port {0} serves https but no key/certificate was configured")]
    TlsRequired(u16),
}

/// Failure loading or parsing TLS key/certificate material
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no key/certificate configured")]
    NotConfigured,

    #[error("failed to read {what} from {}", path.display())]
    Read {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {what}")]
    Parse {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in certificate data")]
    NoCertificates,

    #[error("no private key found in key data")]
    NoPrivateKey,

    #[error("failed to create TLS server config")]
    Config(#[from] rustls::Error),
}

/// Failure registering with, or talking to, the tunnel relay
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel relay request failed")]
    Request(#[from] reqwest::Error),

    #[error("tunnel relay rejected registration: {0}")]
    Rejected(String),

    #[error("tunnel relay returned an invalid url {0:?}")]
    InvalidUrl(String),

    #[error("tunnel relay host {0:?} is not usable")]
    InvalidHost(String),
}
