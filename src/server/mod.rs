// src/server/mod.rs

use crate::config::Config;
use crate::core::conn::Connector;
use anyhow::Result;
use std::sync::Arc;

mod context;
pub mod dispatch;
mod initialization;
mod listener;

pub use context::ServerContext;
pub use dispatch::{CommandArgs, CommandRegistry};

/// The main daemon startup function, orchestrating all setup phases.
pub async fn run(config: Config, connector: Arc<dyn Connector>) -> Result<()> {
    // 1. Initialize the fabric state, warm caches, reconcile, bind.
    let server_context = initialization::setup(config, connector).await?;

    // 2. Serve requests until a shutdown command or signal arrives.
    listener::run(server_context).await
}
