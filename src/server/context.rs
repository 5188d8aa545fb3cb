// src/server/context.rs

use super::dispatch::CommandRegistry;
use crate::core::state::FabricState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Holds all the initialized state required to run the daemon's main loop.
pub struct ServerContext {
    pub state: Arc<FabricState>,
    pub registry: Arc<CommandRegistry>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
}
