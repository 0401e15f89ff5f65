// src/server/connection_loop.rs

//! Contains the reactor loop: it owns the engine, spawns socket tasks and
//! handles graceful shutdown.

use super::context::ServerContext;
use crate::connection::{ConnectionHandler, Origin, ReactorEvent};
use crate::core::{Engine, RelayHooks};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long socket tasks get to flush and close after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The main relay loop. Runs until SIGINT/SIGTERM or a background task fails.
pub async fn run<H: RelayHooks>(
    mut ctx: ServerContext,
    mut engine: Engine<H>,
    events_tx: mpsc::UnboundedSender<ReactorEvent>,
    mut events_rx: mpsc::UnboundedReceiver<ReactorEvent>,
) -> Result<()> {
    let mut socket_tasks = JoinSet::new();

    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            Some(event) = events_rx.recv() => {
                dispatch(&mut engine, event, &ctx, &events_tx, &mut socket_tasks);
            },

            Some(res) = socket_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A socket task panicked: {e:?}");
                }
            },
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    engine.shutdown_all();
    if ctx.shutdown_tx.send(()).is_err() {
        debug!("No task was listening for the shutdown signal.");
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        while socket_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for connections to close; aborting them.");
        socket_tasks.shutdown().await;
    }
    info!("All connections closed.");

    ctx.background_tasks.shutdown().await;
    info!("Relay shutdown complete.");
    Ok(())
}

/// Feeds one socket event into the engine.
fn dispatch<H: RelayHooks>(
    engine: &mut Engine<H>,
    event: ReactorEvent,
    ctx: &ServerContext,
    events_tx: &mpsc::UnboundedSender<ReactorEvent>,
    socket_tasks: &mut JoinSet<()>,
) {
    match event {
        ReactorEvent::Accepted {
            origin,
            peer,
            stream,
        } => {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let id = match origin {
                Origin::Client(listener) => engine.accept_client(listener, peer, outbound_tx),
                Origin::Control => engine.accept_control(peer, outbound_tx),
            };
            let handler = ConnectionHandler::new(
                id,
                stream,
                outbound_rx,
                events_tx.clone(),
                ctx.shutdown_tx.subscribe(),
            );
            socket_tasks.spawn(async move {
                if let Err(e) = handler.run().await {
                    debug!("Connection {id} terminated: {}", e);
                }
            });
        }
        ReactorEvent::Readable { id, data } => engine.on_readable(id, &data),
        ReactorEvent::Drained { id, flushed } => engine.on_writable(id, flushed),
        ReactorEvent::Timeout { id } => engine.on_timeout(id),
        ReactorEvent::Closed { id } => engine.on_error(id),
    }
}
