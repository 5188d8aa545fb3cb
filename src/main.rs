// src/main.rs

//! The main entry point for the fabricd daemon.

use anyhow::Result;
use fabricd::config::Config;
use fabricd::core::conn::mock::MockFarm;
use fabricd::server;
use std::env;
use tracing::{error, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("fabricd version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path.
    // It can be provided via a --config flag; otherwise, it defaults to "fabric.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("fabric.toml");

    // Load the daemon configuration from the determined path.
    // If loading fails, print the error and exit, as the daemon
    // cannot run without a valid configuration.
    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging. The environment variable wins over the config.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    // No external database driver is linked into this build; the daemon
    // drives the in-process farm through the same Connector seam a real
    // driver would plug into.
    warn!("running against the in-process simulation farm; managed servers are emulated");
    let connector = MockFarm::new();

    if let Err(e) = server::run(config, connector).await {
        error!("Daemon runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
