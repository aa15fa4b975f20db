//! chat-relay: a TCP chat relay
//!
//! Clients connect, pick a display name through a two-message handshake,
//! and from then on every message they send is relayed to every other
//! approved client. Messages are length-prefixed frames.
//!
//! The `serve` subcommand (default) runs the relay; `connect` opens an
//! interactive terminal session against one.
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod error;
mod runtime;
mod terminal;

use config::{Config, Mode};
use runtime::{Server, ShutdownHandle};
use std::net::SocketAddr;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let (config, mode) = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match mode {
        Mode::Serve => serve(config),
        Mode::Connect { server, name } => connect(config, &server, name),
    }
}

fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(&config)?;
    info!(
        addr = %server.local_addr(),
        max_clients = config.max_clients,
        max_pending_output = config.max_pending_output,
        "Starting chat relay"
    );
    let shutdown = server.shutdown_handle();
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || wait_for_signal(shutdown))?;

    server.run()?;
    Ok(())
}

/// Block until SIGINT or SIGTERM, then stop the server.
fn wait_for_signal(shutdown: ShutdownHandle) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to start signal handler");
            return;
        }
    };

    rt.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    });

    info!("Shutdown requested");
    shutdown.shutdown();
}

fn connect(
    config: Config,
    server: &str,
    name: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let server: SocketAddr = server
        .parse()
        .map_err(|_| config::ConfigError::BadAddress(server.to_string()))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(terminal::run(server, name, config.max_message_len))
}
