// src/server/spawner.rs

//! Spawns the relay's long-running background tasks: one accept loop per
//! listener and the optional metrics server.

use super::context::ServerContext;
use super::metrics_server;
use super::stream::AnyListener;
use crate::connection::{Origin, ReactorEvent};
use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, trace};

/// Spawns all background tasks into the context's JoinSet.
pub fn spawn_all(ctx: &mut ServerContext, events: &mpsc::UnboundedSender<ReactorEvent>) {
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    // --- Metrics Server ---
    if ctx.config.metrics.enabled {
        let port = ctx.config.metrics.port;
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(port, shutdown_rx_metrics).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- Accept Loops ---
    for (index, listener) in ctx.listeners.drain(..).enumerate() {
        let events = events.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(accept_loop(listener, Origin::Client(index), events, shutdown_rx));
    }

    if let Some(control) = ctx.control.take() {
        let events = events.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(accept_loop(control, Origin::Control, events, shutdown_rx));
    }
}

/// Accepts sockets and hands them to the reactor until shutdown.
async fn accept_loop(
    listener: AnyListener,
    origin: Origin,
    events: mpsc::UnboundedSender<ReactorEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    trace!("Accepted {peer} on {origin:?}.");
                    if events.send(ReactorEvent::Accepted { origin, peer, stream }).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => error!("Failed to accept connection on {origin:?}: {}", e),
            },
        }
    }
}
