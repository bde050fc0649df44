//! eof-echo server binary.
//!
//! Features:
//! - One task per connection, accept loop never waits on a handler
//! - Frame size cap and per-connection idle timeout
//! - Graceful shutdown on Ctrl-C
//! - Configuration via CLI arguments or TOML file

use eof_echo::config::Config;
use eof_echo::server::Listener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        recv_buffer_size = config.recv_buffer_size,
        max_frame_size = config.max_frame_size,
        idle_timeout = ?config.idle_timeout,
        accept_errors = ?config.accept_errors,
        handoff = ?config.handoff,
        "Starting eof-echo server"
    );

    let listener = Listener::from_config(&config)?;
    listener.serve_until(shutdown_signal()).await?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
