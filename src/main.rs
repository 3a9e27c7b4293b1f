//! rprox - Intercepting TCP/TLS relay.

use clap::Parser;
use rprox::{Cli, Error, Proxy, ProxySettings, TrafficLog};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::warn!(
            "failed to install default crypto provider (may already be installed): {:?}",
            e
        );
    }

    if let Err(e) = run(&cli) {
        tracing::error!(error = %e, "fatal");
        std::process::exit(e.exit_code().into());
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    let settings = ProxySettings::from_cli(cli)?;
    let log = match &cli.log_file {
        Some(path) => Some(TrafficLog::create(path)?),
        None => None,
    };
    let mut proxy = Proxy::bind(settings, log)?;
    proxy.run()
}
