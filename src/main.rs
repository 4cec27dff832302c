//! Subr - Main entry point
//!
//! Connects every socket in a directory to http(s)://*.localtest.me

use anyhow::Result;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use subr::config::DEFAULT_LOCAL_DOMAIN;
use subr::{Config, PortSpec, ProxyServer, TlsFiles, TunnelSpec};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const EXAMPLES: &str = "\
Examples:
  subr                              Connects ./* to http://*.localtest.me:<random>
  subr sockets                      Connects ./sockets/* to http://*.localtest.me:<random>
  subr -p 80,443 -k <key> -c <cert> Connects ./* to http(s)://*.localtest.me
  subr -p 1234 -k <key> -c <cert>   Connects ./* to http(s)://*.localtest.me:1234
  subr -t bob.tunnelprovider.com    Connects ./* to http(s)://*.bob.tunnelprovider.com";

/// Subr - expose local socket services under per-subdomain hostnames
#[derive(Parser, Debug)]
#[command(name = "subr")]
#[command(author = "Subr Contributors")]
#[command(version)]
#[command(about = "Expose local socket services under per-subdomain hostnames")]
#[command(after_help = EXAMPLES)]
struct Args {
    /// Directory holding one socket or static directory per backend
    #[arg(default_value = ".")]
    dir: PathBuf,

    /// Port(s) to use, comma separated; 0 or auto lets the OS choose
    #[arg(short, long, env = "SUBR_PORT", value_delimiter = ',')]
    port: Vec<PortSpec>,

    /// File containing the TLS key
    #[arg(short, long, env = "SUBR_KEY", requires = "cert")]
    key: Option<PathBuf>,

    /// File containing the TLS certificate
    #[arg(short, long, env = "SUBR_CERT", requires = "key")]
    cert: Option<PathBuf>,

    /// Tunnel to request, e.g. bob.tunnelprovider.com
    #[arg(short, long, env = "SUBR_TUNNEL")]
    tunnel: Option<TunnelSpec>,

    /// Address to bind listeners on
    #[arg(long, env = "SUBR_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Domain announced for local listeners
    #[arg(long, env = "SUBR_DOMAIN", default_value = DEFAULT_LOCAL_DOMAIN)]
    domain: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Config {
        let tls = match (self.key, self.cert) {
            (Some(key), Some(cert)) => Some(TlsFiles { key, cert }),
            _ => None,
        };

        let ports = if self.port.is_empty() {
            vec![PortSpec::Unspecified]
        } else {
            self.port
        };

        Config {
            base_dir: self.dir,
            ports,
            tls,
            tunnel: self.tunnel,
            bind_addr: self.bind,
            local_domain: self.domain,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting subr v{}", env!("CARGO_PKG_VERSION"));

    let server = ProxyServer::new(args.into_config());

    // Startup failures are reported by the console sink before they land here
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, exiting");
            Ok(())
        }
    }
}
