//! Proxy configuration
//! Port specifications, tunnel requests and the top-level `Config`

use crate::error::ConfigError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

/// Domain announced for local listeners; `*.localtest.me` resolves to 127.0.0.1
pub const DEFAULT_LOCAL_DOMAIN: &str = "localtest.me";

/// A requested listening port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    /// Let the operating system pick a free port
    Unspecified,
    Port(u16),
}

impl PortSpec {
    /// Port number handed to `bind`; 0 asks the OS to choose
    pub fn bind_port(self) -> u16 {
        match self {
            Self::Unspecified => 0,
            Self::Port(port) => port,
        }
    }

    pub fn is(self, port: u16) -> bool {
        self == Self::Port(port)
    }
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        if port == 0 {
            Self::Unspecified
        } else {
            Self::Port(port)
        }
    }
}

impl FromStr for PortSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Unspecified);
        }

        s.parse::<u16>()
            .map(Self::from)
            .map_err(|_| ConfigError::InvalidPort(s.to_string()))
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => f.write_str("unspecified"),
            Self::Port(port) => write!(f, "{}", port),
        }
    }
}

/// Parse a comma separated port list such as `80,443` or `8080,auto`
pub fn parse_ports(list: &str) -> Result<Vec<PortSpec>, ConfigError> {
    list.split(',').map(str::parse).collect()
}

/// A tunnel to request from a public relay, e.g. `bob.tunnelprovider.com`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// First label, the subdomain requested from the relay
    pub subdomain: String,
    /// Remaining labels, the relay's own host
    pub remote_host: String,
}

impl TunnelSpec {
    /// Base URL of the relay's registration endpoint
    pub fn relay_url(&self) -> String {
        format!("http://{}", self.remote_host)
    }
}

impl FromStr for TunnelSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('.') {
            Some((subdomain, remote_host)) if !subdomain.is_empty() && !remote_host.is_empty() => {
                Ok(Self {
                    subdomain: subdomain.to_string(),
                    remote_host: remote_host.to_string(),
                })
            }
            _ => Err(ConfigError::InvalidTunnel(s.to_string())),
        }
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.subdomain, self.remote_host)
    }
}

/// Key and certificate locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub key: PathBuf,
    pub cert: PathBuf,
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one socket (or static directory) per backend name
    pub base_dir: PathBuf,
    /// Listeners to open, in order; only the first may carry the tunnel
    pub ports: Vec<PortSpec>,
    pub tls: Option<TlsFiles>,
    pub tunnel: Option<TunnelSpec>,
    /// Interface every listener binds to
    pub bind_addr: IpAddr,
    /// Domain used when announcing local listener URLs
    pub local_domain: String,
}

impl Config {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            ports: vec![PortSpec::Unspecified],
            tls: None,
            tunnel: None,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_domain: DEFAULT_LOCAL_DOMAIN.to_string(),
        }
    }
}
