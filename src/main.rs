// src/main.rs

//! The main entry point for the wsrelay broker.

use anyhow::Result;
use std::env;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*};
use wsrelay::config::Config;
use wsrelay::core::NoopHooks;
use wsrelay::server::{self, pidfile};

/// What the process was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Stop,
    Restart,
}

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("wsrelay version {VERSION}");
        return Ok(());
    }

    let action = match args.get(1).map(String::as_str) {
        None | Some("start") => Action::Start,
        Some("stop") => Action::Stop,
        Some("restart") => Action::Restart,
        Some(arg) if arg.starts_with("--") => Action::Start,
        Some(other) => {
            eprintln!("Unknown action '{other}'");
            eprintln!("Usage: wsrelay [start|stop|restart] [--config /path/to/config.toml]");
            std::process::exit(1);
        }
    };

    // The configuration path can be provided via a --config flag; otherwise,
    // it defaults to "config.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    // The relay cannot run without a valid configuration.
    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Get initial log level from env var or config.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());

    // Initialize the global subscriber with the filter and formatting layers.
    tracing_subscriber::registry()
        .with(EnvFilter::new(initial_log_level))
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true), // Enable ANSI color codes for log levels.
        )
        .init();

    if matches!(action, Action::Stop | Action::Restart) {
        match pidfile::stop(Path::new(&config.pid_file)).await {
            Ok(pidfile::StopOutcome::Stopped(pid)) => info!("Server stopped (pid {pid})."),
            Ok(pidfile::StopOutcome::NotRunning) => info!("Server is not running."),
            Err(e) => {
                error!("{e:#}");
                std::process::exit(1);
            }
        }
        if action == Action::Stop {
            return Ok(());
        }
    }

    if let Err(e) = server::run(config, NoopHooks).await {
        error!("Relay runtime error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}
