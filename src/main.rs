// src/main.rs

//! The main entry point for the HA supervisor binary.

use anyhow::Result;
use std::env;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("pgwarden version {VERSION}");
        return Ok(());
    }

    if args.len() != 3 || args[1] != "--ha" {
        eprintln!("Usage: pgwarden --ha /path/to/ha.toml");
        std::process::exit(1);
    }
    let config_path = &args[2];

    // Defaults to a more verbose level for the supervisor's own modules.
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,spineldb::core::ha=debug".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    info!("Starting HA supervisor...");

    if let Err(e) = spineldb::ha::run(config_path).await {
        error!("HA supervisor runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
