//! Proxy assembly: settings, bind, and the run loop entry point.

use crate::cli::Cli;
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::reactor::Reactor;
use crate::tls::{self, TlsVersion};
use crate::traffic::TrafficLog;
use rustls::pki_types::ServerName;
use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use tracing::info;

/// Everything the listener needs to serve relays.
#[derive(Debug)]
pub struct ProxySettings {
    pub listen_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    /// TLS server name presented to the backend on the outbound leg.
    pub backend_name: ServerName<'static>,
    pub oneshot: bool,
    pub max_queue_bytes: u64,
    /// TLS termination config for the inbound leg.
    pub server_tls: Option<Arc<rustls::ServerConfig>>,
    /// TLS origination config for the outbound leg.
    pub client_tls: Option<Arc<rustls::ClientConfig>>,
}

impl ProxySettings {
    /// Validates the CLI surface and assembles the settings.
    ///
    /// All failures here are fatal and happen before the reactor starts.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let version = TlsVersion::from_flags(cli.tls12, cli.tls13);

        let server_tls = if cli.tls_in_enabled() {
            let (cert_path, key_path) = listener_cert_paths(cli)?;
            let cert_key = tls::load_cert_key(&cert_path, key_path.as_deref())?;
            Some(Arc::new(tls::build_server_config(&cert_key, version)?))
        } else {
            None
        };

        let client_tls = if cli.tls_out_enabled() {
            let client_cert = match &cli.client_cert {
                Some(cert) => Some(tls::load_cert_key(cert, cli.client_key.as_deref())?),
                None => None,
            };
            Some(Arc::new(tls::build_client_config(
                version,
                client_cert.as_ref(),
            )?))
        } else {
            None
        };

        let backend_addr = resolve_backend(&cli.addr, cli.port, cli.ipv6)?;
        let backend_name = ServerName::try_from(cli.addr.clone())
            .map_err(|_| Error::Config(format!("invalid backend name: {}", cli.addr)))?;

        let bind_ip: IpAddr = cli
            .bind_addr()
            .parse()
            .map_err(|_| Error::Config(format!("invalid bind address: {}", cli.bind_addr())))?;
        let listen_addr = SocketAddr::new(bind_ip, cli.listen_port());

        Ok(Self {
            listen_addr,
            backend_addr,
            backend_name,
            oneshot: cli.oneshot,
            max_queue_bytes: cli.max_queue_bytes,
            server_tls,
            client_tls,
        })
    }
}

/// Certificate and key paths for the TLS listener, provisioning a
/// self-signed pair when `--auto-cert` asks for one.
fn listener_cert_paths(
    cli: &Cli,
) -> Result<(std::path::PathBuf, Option<std::path::PathBuf>)> {
    if let Some(common_name) = &cli.auto_cert {
        let (cert, key) = tls::provision_auto_cert(common_name, Path::new("."))?;
        return Ok((cert, Some(key)));
    }
    match &cli.cert {
        Some(cert) => Ok((cert.clone(), cli.key.clone())),
        None => Err(Error::Config("specify a TLS certificate".to_string())),
    }
}

/// Resolves the backend host/port, preferring the requested address family.
fn resolve_backend(addr: &str, port: u16, ipv6: bool) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = (addr, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve {}:{}: {}", addr, port, e)))?
        .collect();

    candidates
        .iter()
        .find(|a| a.is_ipv6() == ipv6)
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| Error::Config(format!("no address found for {}:{}", addr, port)))
}

/// A bound proxy, ready to run its reactor.
pub struct Proxy {
    reactor: Reactor,
    local_addr: SocketAddr,
}

impl Proxy {
    /// Binds the listener and wires it into a fresh reactor.
    pub fn bind(settings: ProxySettings, log: Option<TrafficLog>) -> Result<Self> {
        let mut reactor = Reactor::new()?;
        let log = log.map(|l| Rc::new(RefCell::new(l)));
        let token = reactor.next_token();
        let listener = Listener::bind(Rc::new(settings), log, token)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening");
        reactor.add(Box::new(listener));
        Ok(Self {
            reactor,
            local_addr,
        })
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the reactor until the registry drains (forever unless one-shot).
    pub fn run(&mut self) -> Result<()> {
        self.reactor.run()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["rprox"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn plain_settings_from_minimal_cli() {
        let settings = ProxySettings::from_cli(&cli(&["127.0.0.1", "8080"])).unwrap();
        assert_eq!(settings.backend_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(settings.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert!(settings.server_tls.is_none());
        assert!(settings.client_tls.is_none());
        assert!(!settings.oneshot);
    }

    #[test]
    fn local_port_and_bind_override_listen_addr() {
        let settings =
            ProxySettings::from_cli(&cli(&["-b", "127.0.0.1", "-L", "9000", "10.0.0.1", "80"]))
                .unwrap();
        assert_eq!(settings.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(settings.backend_addr, "10.0.0.1:80".parse().unwrap());
    }

    #[test]
    fn ipv6_defaults_to_wildcard_bind() {
        let settings = ProxySettings::from_cli(&cli(&["-6", "::1", "80"])).unwrap();
        assert_eq!(settings.listen_addr, "[::]:80".parse().unwrap());
        assert!(settings.backend_addr.is_ipv6());
    }

    #[test]
    fn tls_in_without_cert_is_fatal() {
        let err = ProxySettings::from_cli(&cli(&["--tls-in", "127.0.0.1", "443"])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("certificate"));
    }

    #[test]
    fn missing_cert_file_is_fatal() {
        let err = ProxySettings::from_cli(&cli(&[
            "--tls-in",
            "--cert",
            "/nonexistent/cert.pem",
            "127.0.0.1",
            "443",
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn unresolvable_backend_is_fatal() {
        let err =
            ProxySettings::from_cli(&cli(&["host.invalid.rprox.test", "80"])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
