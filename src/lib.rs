//! Subr - a subdomain router for local socket services
//!
//! Exposes every backend under a base directory as `http(s)://<name>.<domain>`:
//! - The first Host label picks the backend (a Unix socket or a static directory)
//! - Requests and responses are streamed through unmodified
//! - Ports 80/443 serve http/https only, any other port sniffs TLS per connection
//! - The first listener can be published through a localtunnel relay

pub mod body;
pub mod certificate;
pub mod config;
pub mod error;
pub mod listener;
pub mod proxy;
pub mod report;
pub mod resolver;
pub mod server;
pub mod tunnel;

pub use certificate::{FileTlsSource, TlsMaterial, TlsMaterialCache, TlsSource};
pub use config::{parse_ports, Config, PortSpec, TlsFiles, TunnelSpec};
pub use error::{ConfigError, RouteError, TlsError, TunnelError};
pub use listener::{ListenerKind, Protocols};
pub use proxy::ProxyHandler;
pub use report::{ConsoleSink, DiagnosticSink, Event, RecordingSink};
pub use resolver::{BackendResolver, DirectoryResolver};
pub use server::{ListenerInfo, ProxyServer, RunningServer};
pub use tunnel::{LocalTunnelClient, OpenTunnel, TunnelClient};
