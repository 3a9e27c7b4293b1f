//! rprox - Intercepting TCP/TLS relay.
//!
//! Accepts inbound connections, opens a connection to a fixed backend for
//! each one, and copies bytes in both directions over a single-threaded
//! readiness loop. TLS can be terminated on the inbound leg and originated
//! on the outbound leg independently, and proxied traffic can be logged as
//! hex-encoded records.

pub mod cli;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod reactor;
pub mod relay;
pub mod server;
pub mod tls;
pub mod traffic;

pub use cli::{Cli, DEFAULT_MAX_QUEUE_BYTES};
pub use endpoint::{Direction, Endpoint, EndpointError, Transport, RECV_CHUNK};
pub use error::{Error, ExitCode, Result};
pub use listener::Listener;
pub use reactor::{
    DispatchCtx, Pollable, Reactor, Readiness, Status, DEFAULT_IDLE_TIMEOUT_SECS,
};
pub use relay::Relay;
pub use server::{Proxy, ProxySettings};
pub use tls::{
    build_client_config, build_server_config, compute_fingerprint, generate_self_signed_cert,
    load_cert_key, provision_auto_cert, CertKeyPair, NoVerify, TlsError, TlsResult, TlsVersion,
};
pub use traffic::TrafficLog;
