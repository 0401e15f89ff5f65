// src/core/broadcast.rs

//! Fair, write-paced fan-out of broadcast messages.
//!
//! Only the head message is in flight, and only to one connection at a time:
//! the next READY connection gets it once the current holder drains. When the
//! walk runs off the end of the ready set the head is retired and the next
//! message starts again from the lowest READY id.

use crate::core::metrics;
use crate::core::state::{ConnId, Registry};
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug, Default)]
pub struct BroadcastQueue {
    pending: VecDeque<Bytes>,
    /// The connection currently holding the head message.
    pointer: Option<ConnId>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pointer(&self) -> Option<ConnId> {
        self.pointer
    }

    /// Appends an encoded frame. An idle queue starts fan-out right away.
    pub fn push(&mut self, frame: Bytes, registry: &mut Registry) {
        let was_idle = self.pending.is_empty();
        self.pending.push_back(frame);
        if was_idle {
            self.seed(registry);
        }
        self.report();
    }

    /// A connection flushed its output.
    pub fn on_drained(&mut self, id: ConnId, registry: &mut Registry) {
        if self.pointer == Some(id) {
            self.advance(id, registry);
            self.report();
        }
    }

    /// A connection went away; if it held the head, move on as if it drained.
    /// The registry must no longer contain `id`.
    pub fn on_closed(&mut self, id: ConnId, registry: &mut Registry) {
        self.on_drained(id, registry);
    }

    fn advance(&mut self, after: ConnId, registry: &mut Registry) {
        if let Some(next) = registry.next_ready_after(after) {
            self.deliver(next, registry);
            return;
        }
        trace!("Broadcast head reached every ready client; retiring it.");
        self.pending.pop_front();
        self.seed(registry);
    }

    /// Hands the head to the first READY connection, dropping messages for
    /// which nobody is ready.
    fn seed(&mut self, registry: &mut Registry) {
        self.pointer = None;
        while !self.pending.is_empty() {
            if let Some(first) = registry.first_ready() {
                self.deliver(first, registry);
                return;
            }
            self.pending.pop_front();
        }
    }

    fn deliver(&mut self, id: ConnId, registry: &mut Registry) {
        let (Some(head), Some(conn)) = (self.pending.front(), registry.get_mut(id)) else {
            self.pointer = None;
            return;
        };
        conn.outbox.write(head.clone());
        self.pointer = Some(id);
        metrics::BROADCAST_DELIVERIES_TOTAL.inc();
    }

    fn report(&self) {
        metrics::BROADCAST_QUEUE_DEPTH.set(self.pending.len() as f64);
    }
}
