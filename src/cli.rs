//! CLI definitions for rprox.

use clap::{builder::PossibleValuesParser, Parser};
use std::path::PathBuf;

/// Default backpressure bound per relay direction (64MB).
pub const DEFAULT_MAX_QUEUE_BYTES: u64 = 64 * 1024 * 1024;

/// Intercepting TCP relay.
///
/// Listens on a port, opens a connection to the real backend for every
/// accepted client, and copies bytes in both directions. TLS can be
/// terminated on the inbound leg and originated on the outbound leg
/// independently, and all proxied traffic can be logged.
#[derive(Debug, Parser)]
#[command(name = "rprox")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Backend address to forward connections to
    pub addr: String,

    /// Backend port
    pub port: u16,

    /// Use IPv6
    #[arg(short = '6', long)]
    pub ipv6: bool,

    /// Address to bind the listener to
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Local port to listen on (defaults to the backend port)
    #[arg(short = 'L', long)]
    pub local_port: Option<u16>,

    /// Use TLS for both incoming and outgoing connections
    #[arg(short = 's', long)]
    pub tls: bool,

    /// Use TLS for incoming connections
    #[arg(long)]
    pub tls_in: bool,

    /// Use TLS for outgoing connections
    #[arg(long)]
    pub tls_out: bool,

    /// Only speak TLS 1.2
    #[arg(long, conflicts_with = "tls13")]
    pub tls12: bool,

    /// Only speak TLS 1.3
    #[arg(long)]
    pub tls13: bool,

    /// Certificate file for the TLS listener (PEM)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Private key file for the TLS listener (PEM, defaults to the cert file)
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Client certificate for the outgoing leg (PEM)
    #[arg(long)]
    pub client_cert: Option<PathBuf>,

    /// Client certificate key for the outgoing leg (PEM)
    #[arg(long)]
    pub client_key: Option<PathBuf>,

    /// Auto-provision a self-signed listener certificate for this common name
    #[arg(short = 'A', long, value_name = "CN")]
    pub auto_cert: Option<String>,

    /// Handle a single connection, then stop accepting
    #[arg(short = '1', long)]
    pub oneshot: bool,

    /// File to log proxied traffic to
    #[arg(short = 'l', long)]
    pub log_file: Option<PathBuf>,

    /// Suspend reading once a relay direction has this many bytes queued
    #[arg(long, default_value_t = DEFAULT_MAX_QUEUE_BYTES)]
    pub max_queue_bytes: u64,

    /// Log level (debug|info|warn|error)
    #[arg(long, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,
}

impl Cli {
    /// True when the inbound leg should terminate TLS.
    pub fn tls_in_enabled(&self) -> bool {
        self.tls || self.tls_in
    }

    /// True when the outbound leg should originate TLS.
    pub fn tls_out_enabled(&self) -> bool {
        self.tls || self.tls_out
    }

    /// Port the listener binds, defaulting to the backend port.
    pub fn listen_port(&self) -> u16 {
        self.local_port.unwrap_or(self.port)
    }

    /// Bind address, switched to the IPv6 wildcard when `-6` is given and
    /// the address was left at its default.
    pub fn bind_addr(&self) -> &str {
        if self.ipv6 && self.bind == "0.0.0.0" {
            "::"
        } else {
            &self.bind
        }
    }
}
