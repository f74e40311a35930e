//! Tabletop Sync Server
//!
//! Standalone server binary: reads configuration from the environment,
//! starts the WebSocket listener, and runs until interrupted.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tabletop_sync::{ServerConfig, SyncServer, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env();
    info!("tabletop sync server v{}", VERSION);
    info!(
        bind_addr = %config.bind_addr,
        max_connections = config.max_connections,
        auto_create_sessions = config.auto_create_sessions,
        "configuration loaded"
    );

    let server = Arc::new(SyncServer::new(config));

    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                server.shutdown();
            }
        });
    }

    server.run().await?;
    info!("server stopped");
    Ok(())
}
