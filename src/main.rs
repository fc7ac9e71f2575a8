//! Tic-Tac-Toe Game Server
//!
//! Serves the WebSocket endpoint until interrupted.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tictactoe::{
    network::{auth::AuthConfig, server::GameServer},
    ServerConfig, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Tic-Tac-Toe Server v{}", VERSION);

    let config = ServerConfig::from_env()?;
    let auth = AuthConfig::from_env();
    if !auth.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set, every connection will be rejected");
    }

    info!(
        bind_addr = %config.bind_addr,
        max_connections = config.max_connections,
        "Starting server"
    );

    let server = Arc::new(GameServer::new(config, auth));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            signal_server.shutdown();
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
