//! Startup announcements
//! The orchestrator reports what it bound through an injected `DiagnosticSink`

use parking_lot::Mutex;
use std::fmt;
use tracing::{error, info};

/// Something the operator should see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Header printed before any listener binds
    Connecting { target: String },
    /// An OS-chosen plaintext port was prepended for the tunnel
    TunnelPortAdded,
    /// A listener is reachable at `url`
    Listening { index: usize, port: u16, url: String },
    /// One public wildcard form of the registered tunnel
    TunnelOpened { url: String },
    /// Startup failed; the process is about to exit
    Fatal { message: String },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting { target } => write!(f, "Connecting sockets at {} to:", target),
            Self::TunnelPortAdded => f.write_str(
                "tunnel requires http, adding unspecified port for http that will be chosen by os",
            ),
            Self::Listening { url, .. } | Self::TunnelOpened { url } => write!(f, "- {}", url),
            Self::Fatal { message } => write!(f, "error: {}", message),
        }
    }
}

/// Receives startup announcements
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, event: Event);
}

/// Prints announcements to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl DiagnosticSink for ConsoleSink {
    fn report(&self, event: Event) {
        match &event {
            Event::Fatal { message } => error!("Startup failed: {}", message),
            _ => {
                info!(event = ?event, "Startup");
                println!("{}", event);
            }
        }
    }
}

/// Keeps announcements in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// `<scheme>://*.<domain>`, with the port left off when it is the scheme default
pub fn wildcard_url(scheme: &str, domain: &str, port: u16) -> String {
    let default_port = match scheme {
        "https" => 443,
        _ => 80,
    };

    if port == default_port {
        format!("{}://*.{}", scheme, domain)
    } else {
        format!("{}://*.{}:{}", scheme, domain, port)
    }
}
