// src/core/hooks.rs

//! Application callbacks raised by the engine.

use crate::core::protocol::ws_frame::data_frame;
use crate::core::state::{ConnId, Outbox};

/// A handle to one client connection, valid for the duration of a hook call.
/// Frames queued through it go out after anything already pending.
pub struct ClientHandle<'a> {
    id: ConnId,
    outbox: &'a mut Outbox,
}

impl<'a> ClientHandle<'a> {
    pub(crate) fn new(id: ConnId, outbox: &'a mut Outbox) -> Self {
        Self { id, outbox }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn send_text(&mut self, payload: &[u8]) {
        self.outbox.write(data_frame(payload, false));
    }

    pub fn send_binary(&mut self, payload: &[u8]) {
        self.outbox.write(data_frame(payload, true));
    }
}

/// Extension points for embedding applications. Every method has a no-op
/// default, so implementors only override what they need.
///
/// Hooks run on the reactor task and must not block.
pub trait RelayHooks: Send + 'static {
    /// Called once the listeners are bound, before the first accept.
    fn on_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a client completed the upgrade and was registered.
    fn on_handshake(&mut self, _conn: &mut ClientHandle<'_>, _id: ConnId) {}

    /// Called for every complete text message from a client.
    fn on_text_message(&mut self, _conn: &mut ClientHandle<'_>, _id: ConnId, _message: &mut Vec<u8>) {
    }

    /// Called for every complete binary message from a client.
    fn on_binary_message(
        &mut self,
        _conn: &mut ClientHandle<'_>,
        _id: ConnId,
        _message: &mut Vec<u8>,
    ) {
    }
}

/// Hooks that do nothing; clients only receive what the control plane sends.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl RelayHooks for NoopHooks {}
