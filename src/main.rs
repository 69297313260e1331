//! # websocket-hub
//!
//! Standalone WebSocket server: accepts connections, lets clients join rooms
//! with JSON control messages and relays room traffic between members.
//!
//! Configuration is read from `WS_*` environment variables (a `.env` file is
//! honoured). Ctrl+C triggers a graceful shutdown.

use tokio::signal;
use tracing::{info, warn};
use websocket_hub::{config::ServerConfig, server::Server};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env()?;
    config.validate()?;

    let server = Server::new(config)?;
    server.on_connect(|client| info!(client_id = client.id(), "welcome"));
    server.on_message(|client, message| {
        // Plain traffic outside the room protocol is echoed back.
        if let Err(e) = client.send(message) {
            warn!(client_id = client.id(), error = %e, "echo failed");
        }
    });

    let addr = server.start().await?;
    info!(%addr, "websocket-hub running");

    shutdown_signal().await;
    info!("Shutting down gracefully");
    server.shutdown().await;
    Ok(())
}

/// Resolves on Ctrl+C, or at once if the signal handler cannot be installed.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}
