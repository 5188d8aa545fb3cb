// src/server/initialization.rs

//! Handles the complete daemon initialization process: building the service
//! singletons in dependency order, warming the metadata caches, running the
//! startup reconciliation pass, and binding the client transport.

use super::context::ServerContext;
use super::dispatch::CommandRegistry;
use crate::config::Config;
use crate::core::conn::Connector;
use crate::core::state::FabricState;
use crate::core::store::memory::MemoryStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

/// Initializes all daemon components before starting the main loop.
pub async fn setup(config: Config, connector: Arc<dyn Connector>) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let store = Arc::new(MemoryStore::new());
    let state = FabricState::initialize(config, store, connector);
    info!("fabric state initialized");

    state.load_caches().await?;
    state
        .groups
        .reconcile()
        .await
        .context("startup reconciliation failed")?;
    info!("metadata caches loaded and reconciled");

    let address = &state.config.protocol.address;
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("could not bind protocol address {address}"))?;
    info!("fabricd listening on {address}");

    let registry = Arc::new(CommandRegistry::builtin());
    info!("command registry loaded {} method(s)", registry.methods().len());

    Ok(ServerContext {
        state,
        registry,
        listener,
        shutdown_tx,
    })
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "executor configured with {} worker(s), shutdown grace {:?}",
        config.executor.nworkers, config.executor.shutdown_timeout
    );
    info!(
        "managed-server pool capped at {} connection(s) per server",
        config.servers.connections
    );
}
