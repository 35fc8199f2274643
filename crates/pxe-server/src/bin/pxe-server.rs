//! PXE boot server daemon
//!
//! Runs the ProxyDHCP responder, TFTP server, multicast control channel and
//! management API until interrupted. Session state is kept in memory and the
//! image catalog is built from the files in the images directory.

use anyhow::Context;
use imaging_store::InMemoryStore;
use pxe_server::{PxeServer, ServerConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting PXE boot server");

    // Load configuration from PXE_CONFIG and PXE_* environment variables
    let config = ServerConfig::load().context("invalid configuration")?;

    info!("Configuration:");
    info!("  Server IP: {}", config.server_ip);
    info!("  TFTP root: {}", config.tftp.root.display());
    info!("  Images dir: {}", config.multicast.images_dir.display());
    info!("  API: {}", config.api.bind);

    let store = Arc::new(InMemoryStore::new());
    match store.register_images_in(&config.multicast.images_dir) {
        Ok(count) => info!(count, "Registered images"),
        Err(e) => warn!(error = %e, "No images registered"),
    }

    let server = PxeServer::new(config, store.clone(), store).context("failed to build PXE server")?;
    server.start().await.context("failed to start PXE server")?;

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    server.shutdown().await.context("shutdown failed")?;

    Ok(())
}
