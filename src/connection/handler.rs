// src/connection/handler.rs

//! Defines the `ConnectionHandler`, the socket task behind every connection.

use super::ReactorEvent;
use super::guard::ConnectionGuard;
use crate::core::RelayError;
use crate::core::state::{ConnId, Outbound};
use crate::server::AnyStream;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

/// Largest chunk handed to the engine per read.
const READ_CHUNK: usize = 4096;

/// Used until the engine's first `SetIdleTimeout` arrives, which it queues
/// before the task starts.
const INITIAL_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ConnectionHandler {
    id: ConnId,
    stream: AnyStream,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ReactorEvent>,
    shutdown_rx: broadcast::Receiver<()>,
    idle_timeout: Duration,
    flushed: u64,
}

impl ConnectionHandler {
    pub fn new(
        id: ConnId,
        stream: AnyStream,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        events: mpsc::UnboundedSender<ReactorEvent>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            stream,
            outbound_rx,
            events,
            shutdown_rx,
            idle_timeout: INITIAL_IDLE_TIMEOUT,
            flushed: 0,
        }
    }

    /// Runs until the peer disconnects, the engine asks for a shutdown, or
    /// the process stops.
    pub async fn run(self) -> Result<(), RelayError> {
        let ConnectionHandler {
            id,
            stream,
            mut outbound_rx,
            events,
            mut shutdown_rx,
            mut idle_timeout,
            mut flushed,
        } = self;
        let _guard = ConnectionGuard::new(id, events.clone());
        let (mut reader, mut writer): (ReadHalf<AnyStream>, WriteHalf<AnyStream>) =
            tokio::io::split(stream);
        let mut chunk = [0u8; READ_CHUNK];
        let idle = sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!("Connection {id} received the shutdown signal.");
                    break;
                }

                instruction = outbound_rx.recv() => {
                    let Some(instruction) = instruction else { break };
                    let mut stop = false;
                    let mut wrote = false;
                    let mut next = Some(instruction);
                    // Apply everything already queued before reporting a drain.
                    while let Some(instruction) = next.take() {
                        match instruction {
                            Outbound::Write(bytes) => {
                                writer.write_all(&bytes).await?;
                                flushed += 1;
                                wrote = true;
                            }
                            Outbound::SetIdleTimeout(timeout) => {
                                idle_timeout = timeout;
                                idle.as_mut().reset(Instant::now() + idle_timeout);
                            }
                            Outbound::Shutdown => {
                                stop = true;
                                break;
                            }
                        }
                        next = outbound_rx.try_recv().ok();
                    }
                    if wrote {
                        writer.flush().await?;
                        if events.send(ReactorEvent::Drained { id, flushed }).is_err() {
                            break;
                        }
                    }
                    if stop {
                        trace!("Connection {id} shut down by the engine.");
                        break;
                    }
                }

                read = reader.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        debug!("Connection {id} reached EOF.");
                        break;
                    }
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    let data = Bytes::copy_from_slice(&chunk[..n]);
                    if events.send(ReactorEvent::Readable { id, data }).is_err() {
                        break;
                    }
                }

                _ = &mut idle => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    if events.send(ReactorEvent::Timeout { id }).is_err() {
                        break;
                    }
                }
            }
        }

        let _ = writer.shutdown().await;
        Ok(())
    }
}
