//! peer-reactor: handshake responder and one-shot ping client.
//!
//! By default the binary binds an acceptor and serves until interrupted.
//! With `--ping <ADDR>` it pings one peer, prints the decoded message and
//! exits.

use peer_reactor::config::Config;
use peer_reactor::protocols::handshake::{HandshakeMessage, LogPersist, Messenger, PingLoader};
use peer_reactor::runtime;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.ping {
        Some(destination) => run_ping(&config, destination),
        None => run_server(&config),
    }
}

/// Serve until the loop thread exits.
fn run_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        protocol_version = %config.protocol_version,
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        "Starting peer-reactor responder"
    );

    let server = runtime::serve(config)?;
    match server.handle.join() {
        Ok(result) => result?,
        Err(_) => return Err("dispatcher thread panicked".into()),
    }
    Ok(())
}

/// Ping one peer and print what it answered.
fn run_ping(
    config: &Config,
    destination: std::net::SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(peer = %destination, "Pinging peer");

    let loader = PingLoader::with_options(Arc::new(LogPersist), config.loader_options());
    let messenger = Messenger::new(Arc::new(loader));
    let printer = |message: &HandshakeMessage| println!("{message}");

    messenger.ping(destination, Arc::new(printer))?;
    Ok(())
}
