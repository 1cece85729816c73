// src/main.rs

//! The main entry point for the vigild monitoring agent.

use anyhow::Result;
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};
use vigild::config::ConfigStore;
use vigild::server;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("vigild version {VERSION}");
        return Ok(());
    }

    // Determine the configuration directory. It can be provided via a
    // --config-dir flag; otherwise it defaults to "vigild_data".
    let config_dir = args
        .iter()
        .position(|arg| arg == "--config-dir")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("vigild_data");

    // Load the local configuration layers. If this fails, print the error
    // and exit: the agent cannot run without its configuration directory.
    let config = match ConfigStore::new(config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_dir}\": {e}");
            std::process::exit(1);
        }
    };

    // Override the control port if provided as a command-line argument.
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).and_then(|s| s.parse::<u16>().ok()) {
            Some(port) => config.set("ports.control", serde_json::json!(port)),
            None => {
                eprintln!("--port flag requires a valid port number");
                std::process::exit(1);
            }
        }
    }

    // Setup logging with reloading capabilities. The initial level comes
    // from the environment or the configuration.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        let level = config.get_str("logging.level");
        if level.is_empty() { "info".to_string() } else { level }
    });

    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    // The agent's own log file doubles as the auto-monitor tail source.
    let log_path = {
        let raw = config.get_str("logging.path");
        let path = std::path::PathBuf::from(&raw);
        if path.is_absolute() {
            path
        } else {
            config.paths().dir.join(path)
        }
    };
    let file_layer = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(false)
                .with_writer(Arc::new(file))
        });
    if file_layer.is_none() {
        eprintln!("warning: could not open agent log file at {}", log_path.display());
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true),
        )
        .with(file_layer)
        .init();

    // Store the handle in an Arc so the config layer can change the log
    // level at runtime.
    let reload_handle = Arc::new(reload_handle);

    info!("vigild {VERSION} starting (config dir: {config_dir})");
    if let Err(e) = server::run(config, reload_handle).await {
        error!("Agent runtime error: {e}");
        return Err(e);
    }

    Ok(())
}
