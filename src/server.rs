//! Proxy server orchestration
//! Plans every listener, binds them in order, announces them and opens the tunnel

use crate::certificate::{FileTlsSource, TlsMaterialCache, TlsSource};
use crate::config::{Config, PortSpec};
use crate::listener::{ListenerDescriptor, Protocols};
use crate::proxy::ProxyHandler;
use crate::report::{wildcard_url, ConsoleSink, DiagnosticSink, Event};
use crate::resolver::{BackendResolver, DirectoryResolver};
use crate::tunnel::{LocalTunnelClient, OpenTunnel, TunnelClient};
use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Listener list actually built: a lone 443 cannot carry a tunnel, so an
/// OS-chosen plaintext port is put in front of it
pub fn effective_ports(ports: &[PortSpec], tunnel_requested: bool) -> Vec<PortSpec> {
    let mut effective = ports.to_vec();
    if tunnel_requested && ports.len() == 1 && ports[0].is(443) {
        effective.insert(0, PortSpec::Unspecified);
    }
    effective
}

/// A listener as it ended up after binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerInfo {
    pub index: usize,
    pub requested: PortSpec,
    pub port: u16,
    pub protocols: Protocols,
}

/// Proxy server
pub struct ProxyServer {
    config: Config,
    resolver: Arc<dyn BackendResolver>,
    tls: Arc<TlsMaterialCache>,
    tunnel_client: Arc<dyn TunnelClient>,
    sink: Arc<dyn DiagnosticSink>,
}

impl ProxyServer {
    /// Create a new proxy server with the default collaborators
    pub fn new(config: Config) -> Self {
        let resolver = Arc::new(DirectoryResolver::new(config.base_dir.clone()));
        let tls_source = config
            .tls
            .clone()
            .map(|files| Box::new(FileTlsSource::new(files)) as Box<dyn TlsSource>);
        let tunnel_client =
            Arc::new(LocalTunnelClient::new().with_local_host(loopback_for(config.bind_addr)));

        Self {
            config,
            resolver,
            tls: Arc::new(TlsMaterialCache::new(tls_source)),
            tunnel_client,
            sink: Arc::new(ConsoleSink),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn BackendResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace where key and certificate are read from
    pub fn with_tls_source(mut self, source: Box<dyn TlsSource>) -> Self {
        self.tls = Arc::new(TlsMaterialCache::new(Some(source)));
        self
    }

    pub fn with_tunnel_client(mut self, client: Arc<dyn TunnelClient>) -> Self {
        self.tunnel_client = client;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Bind every listener and open the tunnel
    ///
    /// Any bind, TLS or tunnel failure is reported to the sink and returned;
    /// nothing is retried.
    pub async fn start(&self) -> Result<RunningServer> {
        match self.launch().await {
            Ok(running) => Ok(running),
            Err(e) => {
                self.sink.report(Event::Fatal {
                    message: format!("{:#}", e),
                });
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<RunningServer> {
        self.config.validate()?;

        let ports = effective_ports(&self.config.ports, self.config.tunnel.is_some());
        if ports.len() != self.config.ports.len() {
            self.sink.report(Event::TunnelPortAdded);
        }

        let descriptors = ports
            .iter()
            .enumerate()
            .map(|(index, &port)| ListenerDescriptor::build(index, port, &self.tls))
            .collect::<Result<Vec<_>>>()?;

        self.sink.report(Event::Connecting {
            target: self.resolver.describe(),
        });

        let handler = ProxyHandler::new(self.resolver.clone());
        let mut listeners = Vec::with_capacity(descriptors.len());
        let mut tasks = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let bound = match descriptor.bind(self.config.bind_addr).await {
                Ok(bound) => bound,
                Err(e) => {
                    abort_all(&tasks);
                    return Err(e);
                }
            };
            let info = ListenerInfo {
                index: bound.descriptor.index,
                requested: bound.descriptor.requested,
                port: bound.port(),
                protocols: bound.descriptor.protocols,
            };
            self.announce(&info);

            listeners.push(info);
            tasks.push(tokio::spawn(bound.serve(handler.clone())));
        }

        let tunnel = match (&self.config.tunnel, listeners.first()) {
            (Some(spec), Some(first)) => {
                let tunnel = match self.tunnel_client.open(first.port, spec).await {
                    Ok(tunnel) => tunnel,
                    Err(e) => {
                        abort_all(&tasks);
                        return Err(e).with_context(|| {
                            format!("Failed to open tunnel {} for port {}", spec, first.port)
                        });
                    }
                };

                let wildcard = tunnel.wildcard_host();
                for scheme in ["http", "https"] {
                    self.sink.report(Event::TunnelOpened {
                        url: format!("{}://{}", scheme, wildcard),
                    });
                }
                Some(tunnel)
            }
            _ => None,
        };

        Ok(RunningServer {
            listeners,
            tunnel,
            tasks,
        })
    }

    /// Start and serve until a listener task dies
    pub async fn run(&self) -> Result<()> {
        self.start().await?.wait().await
    }

    fn announce(&self, info: &ListenerInfo) {
        let domain = &self.config.local_domain;
        let schemes = [("http", info.protocols.http), ("https", info.protocols.https)];

        for (scheme, enabled) in schemes {
            if enabled {
                self.sink.report(Event::Listening {
                    index: info.index,
                    port: info.port,
                    url: wildcard_url(scheme, domain, info.port),
                });
            }
        }
    }
}

fn abort_all(tasks: &[JoinHandle<()>]) {
    for task in tasks {
        task.abort();
    }
}

/// Loopback address of the same family, for reaching a wildcard bind locally
fn loopback_for(bind_addr: IpAddr) -> IpAddr {
    match bind_addr {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    }
}

/// Handle to a started server
pub struct RunningServer {
    pub listeners: Vec<ListenerInfo>,
    pub tunnel: Option<OpenTunnel>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Port the listener at `index` ended up on
    pub fn port(&self, index: usize) -> Option<u16> {
        self.listeners.get(index).map(|l| l.port)
    }

    /// Wait for the accept loops; they only end on panic or abort
    pub async fn wait(self) -> Result<()> {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Listener task ended");
                return Err(e).context("Listener task ended");
            }
        }
        Ok(())
    }

    /// Stop accepting and close the tunnel
    pub fn shutdown(&self) {
        info!(listeners = self.listeners.len(), "Shutting down");
        abort_all(&self.tasks);
        if let Some(tunnel) = &self.tunnel {
            tunnel.close();
        }
    }
}
