//! Runs the relay until shutdown is requested.

use std::sync::Arc;
use std::time::Duration;

use peerbeam_relay::{RelayConfig, RelayServer};

use crate::config::Config;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let server = RelayServer::new(RelayConfig { port: config.port });

    let server_run = Arc::clone(&server);
    let handle = tokio::spawn(async move {
        if let Err(e) = server_run.run().await {
            tracing::error!("relay error: {e}");
        }
    });

    // Wait for the listener to bind.
    let port = loop {
        if handle.is_finished() {
            anyhow::bail!("relay failed to start");
        }
        let p = server.port().await;
        if p > 0 {
            break p;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    tracing::info!(port, "relay ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    server.shutdown();
    let _ = handle.await;
    Ok(())
}
