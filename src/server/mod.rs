// src/server/mod.rs

use crate::config::Config;
use crate::core::{Engine, EngineSettings, RelayHooks};
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
pub mod pidfile;
mod spawner;
mod stream;

pub use stream::{AnyListener, AnyStream, Endpoint};

/// The main relay startup function, orchestrating all setup phases.
pub async fn run<H: RelayHooks>(config: Config, hooks: H) -> Result<()> {
    // 1. Check endpoints and the PID file, then bind every listener.
    let mut server_context = initialization::setup(config).await?;
    let endpoints = server_context.endpoints.clone();
    let pid_file = server_context.config.pid_file.clone();

    let result = async {
        let settings = EngineSettings::from_config(&server_context.config);
        let mut engine = Engine::new(settings, server_context.config.domains.clone(), hooks);

        // 2. Listeners are up; let the application finish its own setup.
        engine.start()?;

        // 3. Spawn accept loops and the metrics server.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        spawner::spawn_all(&mut server_context, &events_tx);
        info!("Started successfully");

        // 4. Run the reactor until shutdown.
        connection_loop::run(server_context, engine, events_tx, events_rx).await
    }
    .await;

    initialization::cleanup(&endpoints, &pid_file);
    result
}
