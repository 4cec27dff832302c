//! Public tunnel support
//! Registers a local port with a localtunnel-compatible relay and keeps the relay connections open

use crate::config::TunnelSpec;
use crate::error::TunnelError;
use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

/// Pause before reopening a relay connection that failed or carried nothing
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Publishes a local port under a public URL
#[async_trait]
pub trait TunnelClient: Send + Sync {
    async fn open(&self, local_port: u16, spec: &TunnelSpec) -> Result<OpenTunnel, TunnelError>;
}

/// A registered tunnel
#[derive(Debug)]
pub struct OpenTunnel {
    /// Public URL assigned by the relay, e.g. `https://bob.tunnelprovider.com`
    pub url: String,
    tasks: Vec<JoinHandle<()>>,
}

impl OpenTunnel {
    pub fn new(url: impl Into<String>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            url: url.into(),
            tasks,
        }
    }

    /// `*.<public host>` form of the assigned URL
    pub fn wildcard_host(&self) -> String {
        wildcard_host(&self.url)
    }

    /// Stop relaying connections
    pub fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Replace the scheme of a public URL with a `*.` wildcard label
pub fn wildcard_host(url: &str) -> String {
    let host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
        .trim_end_matches('/');
    format!("*.{}", host)
}

/// Relay reply to a successful registration
#[derive(Debug, Deserialize)]
struct Registration {
    id: String,
    url: String,
    port: u16,
    #[serde(default = "default_max_conn_count")]
    max_conn_count: usize,
    #[serde(default)]
    ip: Option<String>,
}

fn default_max_conn_count() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct Rejection {
    message: String,
}

/// Client for the localtunnel relay protocol
///
/// Registration is a plain `GET <relay>/<subdomain>`; the relay answers with
/// a TCP port on which it expects up to `max_conn_count` connections, each of
/// which is piped to the local listener.
#[derive(Debug, Clone)]
pub struct LocalTunnelClient {
    http: reqwest::Client,
    local_host: IpAddr,
}

impl LocalTunnelClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            local_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    /// Address relayed connections are forwarded to
    pub fn with_local_host(mut self, local_host: IpAddr) -> Self {
        self.local_host = local_host;
        self
    }

    async fn register(&self, spec: &TunnelSpec) -> Result<Registration, TunnelError> {
        let endpoint = format!("{}/{}", spec.relay_url(), spec.subdomain);
        debug!(endpoint = %endpoint, "Requesting tunnel");

        let response = self.http.get(&endpoint).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<Rejection>(&body)
                .map(|r| r.message)
                .unwrap_or_else(|_| format!("{} {}", status, body.trim()));
            return Err(TunnelError::Rejected(message));
        }

        serde_json::from_str(&body)
            .map_err(|e| TunnelError::Rejected(format!("unexpected registration reply: {}", e)))
    }

    /// Keep one relay connection open, reopening it whenever it ends
    async fn pump(remote: String, local: SocketAddr) {
        loop {
            match relay_once(&remote, local).await {
                Ok((0, 0)) => {
                    debug!(remote = %remote, "Tunnel connection closed without traffic");
                    sleep(RECONNECT_DELAY).await;
                }
                Ok((up, down)) => {
                    debug!(remote = %remote, up, down, "Tunnel connection finished, reopening");
                }
                Err(e) => {
                    warn!(remote = %remote, error = %e, "Tunnel connection failed");
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

impl Default for LocalTunnelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelClient for LocalTunnelClient {
    async fn open(&self, local_port: u16, spec: &TunnelSpec) -> Result<OpenTunnel, TunnelError> {
        let registration = self.register(spec).await?;

        Url::parse(&registration.url)
            .map_err(|_| TunnelError::InvalidUrl(registration.url.clone()))?;

        let relay_host = match registration.ip {
            Some(ip) => ip,
            None => Url::parse(&spec.relay_url())
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .ok_or_else(|| TunnelError::InvalidHost(spec.remote_host.clone()))?,
        };
        let remote = format!("{}:{}", relay_host, registration.port);
        let local = SocketAddr::new(self.local_host, local_port);

        info!(
            id = %registration.id,
            url = %registration.url,
            remote = %remote,
            connections = registration.max_conn_count,
            "Tunnel registered"
        );

        let tasks = (0..registration.max_conn_count.max(1))
            .map(|_| tokio::spawn(Self::pump(remote.clone(), local)))
            .collect();

        Ok(OpenTunnel::new(registration.url, tasks))
    }
}

/// Connect relay and local listener and copy until either side closes
async fn relay_once(remote: &str, local: SocketAddr) -> io::Result<(u64, u64)> {
    let mut remote = TcpStream::connect(remote).await?;
    let mut local = TcpStream::connect(local).await?;
    copy_bidirectional(&mut remote, &mut local).await
}
