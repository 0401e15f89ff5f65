// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard that reports a socket task's exit.

use super::ReactorEvent;
use crate::core::state::ConnId;
use tokio::sync::mpsc;
use tracing::debug;

/// Tells the reactor the connection is gone however the socket task ends,
/// including by panic or cancellation.
pub struct ConnectionGuard {
    id: ConnId,
    events: mpsc::UnboundedSender<ReactorEvent>,
}

impl ConnectionGuard {
    pub(crate) fn new(id: ConnId, events: mpsc::UnboundedSender<ReactorEvent>) -> Self {
        Self { id, events }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        debug!("Socket task for connection {} exiting.", self.id);
        // The reactor may already be gone during shutdown.
        let _ = self.events.send(ReactorEvent::Closed { id: self.id });
    }
}
