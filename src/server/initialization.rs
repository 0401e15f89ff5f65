// src/server/initialization.rs

//! Handles relay initialization: endpoint checks, PID-file handling and
//! binding every listener.

use super::context::ServerContext;
use super::pidfile;
use super::stream::{AnyListener, Endpoint};
use crate::config::Config;
use anyhow::{Context, Result, anyhow};
use std::path::Path;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Initializes all relay components before starting the main loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let servers = config
        .servers
        .iter()
        .map(|raw| Endpoint::parse(raw).with_context(|| format!("Invalid server endpoint '{raw}'")))
        .collect::<Result<Vec<_>>>()?;
    let control = Endpoint::parse(&config.control)
        .with_context(|| format!("Invalid control endpoint '{}'", config.control))?;

    let pid_path = Path::new(&config.pid_file);
    check_parent_dir(pid_path)?;
    for endpoint in servers.iter().chain(std::iter::once(&control)) {
        if let Some(path) = endpoint.unix_path() {
            check_parent_dir(path)?;
        }
    }
    pidfile::ensure_not_running(pid_path)?;

    let mut listeners = Vec::with_capacity(servers.len());
    for endpoint in &servers {
        listeners.push(bind(endpoint).await?);
        info!("Relay listening on {endpoint}");
    }
    let control_listener = bind(&control).await?;
    info!("Control plane listening on {control}");

    pidfile::write_pid(pid_path)?;

    let mut endpoints = servers;
    endpoints.push(control);
    Ok(ServerContext {
        config,
        listeners,
        control: Some(control_listener),
        endpoints,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

/// Binds one endpoint, unlinking a leftover unix socket file first.
async fn bind(endpoint: &Endpoint) -> Result<AnyListener> {
    if let Some(path) = endpoint.unix_path()
        && path.exists()
    {
        warn!("Removing stale socket file {}", path.display());
        std::fs::remove_file(path)
            .with_context(|| format!("Unable to remove stale socket {}", path.display()))?;
    }
    AnyListener::bind(endpoint)
        .await
        .with_context(|| format!("Unable to create socket server {endpoint}"))
}

fn check_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => Err(anyhow!(
            "Directory {} does not exist",
            parent.display()
        )),
        _ => Ok(()),
    }
}

/// Removes unix socket files and the PID file on the way out.
pub fn cleanup(endpoints: &[Endpoint], pid_file: &str) {
    for path in endpoints.iter().filter_map(Endpoint::unix_path) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Unable to remove socket {}: {}", path.display(), e);
        }
    }
    if let Err(e) = pidfile::remove(Path::new(pid_file)) {
        warn!("{e:#}");
    }
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Limits: handshake {} bytes, frames {} bytes, control {} bytes.",
        config.limits.handshake_buffer, config.limits.frame_buffer, config.limits.control_buffer
    );
    info!(
        "Keepalive every {:?}; tokens live for {:?}.",
        config.timeouts.keepalive, config.auth.token_lifetime
    );
    info!("{} allowed origin(s).", config.origins.len());
}
