//! Listeners
//! Decides which protocols a port serves, binds it and runs its accept loop

use crate::certificate::TlsMaterialCache;
use crate::config::PortSpec;
use crate::error::ConfigError;
use crate::proxy::ProxyHandler;
use anyhow::{anyhow, Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// First byte of a TLS record carrying a handshake message
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Protocols served on one listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocols {
    pub http: bool,
    pub https: bool,
}

/// How a listener treats new connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Plain,
    Tls,
    /// Peeks at the first byte to pick TLS or plaintext per connection
    Sniffing,
}

impl Protocols {
    /// Port 80 is plaintext only, 443 TLS only, anything else plaintext
    /// plus TLS when key material is configured.
    pub fn for_port(port: PortSpec, tls_configured: bool) -> Self {
        if port.is(80) {
            Self {
                http: true,
                https: false,
            }
        } else if port.is(443) {
            Self {
                http: false,
                https: true,
            }
        } else {
            Self {
                http: true,
                https: tls_configured,
            }
        }
    }

    pub fn kind(self) -> ListenerKind {
        match (self.http, self.https) {
            (true, true) => ListenerKind::Sniffing,
            (false, true) => ListenerKind::Tls,
            _ => ListenerKind::Plain,
        }
    }
}

/// A listener that has been planned but not bound yet
pub struct ListenerDescriptor {
    pub index: usize,
    pub requested: PortSpec,
    pub protocols: Protocols,
    acceptor: Option<TlsAcceptor>,
}

impl ListenerDescriptor {
    /// Plan the listener for `requested`, pulling the shared acceptor from
    /// the cache when TLS is involved
    pub fn build(index: usize, requested: PortSpec, tls: &TlsMaterialCache) -> Result<Self> {
        let protocols = Protocols::for_port(requested, tls.is_configured());

        let acceptor = if protocols.https {
            if !tls.is_configured() {
                return Err(ConfigError::TlsRequired(requested.bind_port()).into());
            }
            Some(tls.acceptor().context("Failed to load TLS material")?)
        } else {
            None
        };

        Ok(Self {
            index,
            requested,
            protocols,
            acceptor,
        })
    }

    pub fn kind(&self) -> ListenerKind {
        self.protocols.kind()
    }

    /// Bind the socket; failure here is fatal to startup
    pub async fn bind(self, ip: IpAddr) -> Result<BoundListener> {
        let addr = SocketAddr::new(ip, self.requested.bind_port());
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind listener {} on {}", self.index, addr))?;
        let local_addr = listener.local_addr()?;

        info!(
            index = self.index,
            requested = %self.requested,
            addr = %local_addr,
            kind = ?self.kind(),
            "Listener bound"
        );

        Ok(BoundListener {
            descriptor: self,
            listener,
            local_addr,
        })
    }
}

/// A bound listener, ready to accept connections
pub struct BoundListener {
    pub descriptor: ListenerDescriptor,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundListener {
    /// Resolved port, meaningful for OS-chosen ports
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accept connections forever
    pub async fn serve(self, handler: ProxyHandler) {
        let kind = self.descriptor.kind();
        let acceptor = self.descriptor.acceptor;

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(addr = %self.local_addr, error = %e, "Accept failed");
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let handler = handler.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, kind, acceptor, handler).await {
                    debug!("Connection error from {}: {:#}", remote_addr, e);
                }
            });
        }
    }
}

/// Handle a single connection according to the listener kind
async fn handle_connection(
    stream: TcpStream,
    kind: ListenerKind,
    acceptor: Option<TlsAcceptor>,
    handler: ProxyHandler,
) -> Result<()> {
    let use_tls = match kind {
        ListenerKind::Plain => false,
        ListenerKind::Tls => true,
        ListenerKind::Sniffing => is_tls_handshake(&stream).await?,
    };

    if !use_tls {
        return serve_http(stream, handler).await;
    }

    let acceptor = acceptor.ok_or_else(|| anyhow!("TLS connection on a listener without TLS"))?;
    let stream = acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?;

    serve_http(stream, handler).await
}

/// Whether the client opened with a TLS handshake record
///
/// Nothing is consumed; the bytes stay queued for whichever side reads next.
async fn is_tls_handshake(stream: &TcpStream) -> Result<bool> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    Ok(n == 1 && first[0] == TLS_HANDSHAKE_RECORD)
}

/// Serve HTTP/1.1 on an established (plain or decrypted) stream
async fn serve_http<S>(io: S, handler: ProxyHandler) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(
            TokioIo::new(io),
            service_fn(move |req| {
                let handler = handler.clone();
                async move { handler.handle(req).await }
            }),
        )
        .await
        .map_err(|e| anyhow!("HTTP service error: {}", e))
}
