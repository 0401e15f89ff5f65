// src/core/state/connection.rs

//! Per-connection state for WebSocket clients and control-plane peers.

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

/// Identifier handed out by the engine's monotonically increasing allocator.
/// Client and control connections share the same id space.
pub type ConnId = u64;

bitflags! {
    /// Lifecycle flags of a connection. Several can be set at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u8 {
        /// A close handshake was started by the relay and is draining.
        const CLOSING = 1;
        /// Terminal; the connection is torn down once its output drains.
        const CLOSED = 1 << 1;
        /// The HTTP upgrade completed.
        const HANDSHAKE_DONE = 1 << 2;
        /// Authenticated and free to receive broadcast, direct or locked traffic.
        const READY = 1 << 3;
        /// Keepalive answer or activity seen since the last idle check.
        const ALIVE = 1 << 4;
    }
}

/// An instruction for the socket task that owns the other end of an `Outbox`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write these bytes, in order, after everything queued before them.
    Write(Bytes),
    /// Fire a timeout event after this long without inbound data.
    SetIdleTimeout(Duration),
    /// Close the socket.
    Shutdown,
}

/// The engine's write side of a connection.
///
/// Every write bumps `queued`; the socket task reports how many writes it has
/// flushed, and the connection only counts as drained once both agree.
#[derive(Debug)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
    queued: u64,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx, queued: 0 }
    }

    pub fn write(&mut self, frame: Bytes) {
        self.queued += 1;
        if self.tx.send(Outbound::Write(frame)).is_err() {
            trace!("Dropping write for a connection whose socket task has exited.");
        }
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        let _ = self.tx.send(Outbound::SetIdleTimeout(timeout));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Outbound::Shutdown);
    }

    pub fn queued(&self) -> u64 {
        self.queued
    }

    /// True when `flushed` writes cover everything queued so far.
    pub fn is_drained_at(&self, flushed: u64) -> bool {
        flushed >= self.queued
    }
}

/// A WebSocket client connection.
#[derive(Debug)]
pub struct ClientConn {
    pub id: ConnId,
    /// Index of the listener that accepted the socket.
    pub listener: usize,
    pub peer: String,
    pub flags: ConnFlags,
    /// Raw bytes received but not yet parsed.
    pub buffer: BytesMut,
    /// Unix time at which the auth token runs out.
    pub expires_at: Option<i64>,
    /// Unix time at which CLOSING was entered.
    pub closing_since: Option<i64>,
    /// The auth token, set once the upgrade succeeds.
    pub token: Option<Bytes>,
    pub outbox: Outbox,
}

impl ClientConn {
    pub fn new(id: ConnId, listener: usize, peer: String, outbox: Outbox) -> Self {
        Self {
            id,
            listener,
            peer,
            flags: ConnFlags::ALIVE,
            buffer: BytesMut::new(),
            expires_at: None,
            closing_since: None,
            token: None,
            outbox,
        }
    }

    pub fn begin_closing(&mut self, now: i64) {
        self.flags.insert(ConnFlags::CLOSING);
        self.closing_since = Some(now);
    }

    /// True once a relay-initiated close has waited longer than `grace` seconds.
    pub fn closing_overdue(&self, now: i64, grace: i64) -> bool {
        self.flags.contains(ConnFlags::CLOSING)
            && self.closing_since.is_some_and(|since| now - since > grace)
    }

    pub fn is_token_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expiry| expiry < now)
    }
}

/// A control-plane connection from a trusted backend.
#[derive(Debug)]
pub struct ControlConn {
    pub id: ConnId,
    pub peer: String,
    pub flags: ConnFlags,
    pub buffer: BytesMut,
    pub outbox: Outbox,
}

impl ControlConn {
    pub fn new(id: ConnId, peer: String, outbox: Outbox) -> Self {
        Self {
            id,
            peer,
            flags: ConnFlags::ALIVE,
            buffer: BytesMut::new(),
            outbox,
        }
    }
}
