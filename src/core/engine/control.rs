// src/core/engine/control.rs

//! The control-plane command processor.

use super::Engine;
use crate::core::RelayError;
use crate::core::hooks::RelayHooks;
use crate::core::metrics;
use crate::core::protocol::control_frame::{ControlCommand, ControlReply, FragmentKind};
use crate::core::protocol::ws_frame::{CLOSE_INTERNAL_ERROR, close_frame, encode_frame};
use crate::core::state::{ConnFlags, ConnId};
use bytes::Bytes;
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

impl<H: RelayHooks> Engine<H> {
    pub(super) fn control_readable(&mut self, id: ConnId, data: &[u8]) {
        let cap = self.settings.limits.control_buffer;
        let Some(conn) = self.controls.get_mut(&id) else {
            return;
        };
        if conn.flags.contains(ConnFlags::CLOSED) {
            return;
        }
        conn.buffer.extend_from_slice(data);
        if conn.buffer.len() >= cap {
            self.control_protocol_error(id, RelayError::BufferOverflow(cap));
            return;
        }

        let mut codec = self.control_codec;
        loop {
            let Some(conn) = self.controls.get_mut(&id) else {
                return;
            };
            if conn.flags.contains(ConnFlags::CLOSED) {
                return;
            }
            let frame = match codec.decode(&mut conn.buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    self.control_protocol_error(id, e);
                    return;
                }
            };
            let command = match ControlCommand::try_from(frame) {
                Ok(command) => command,
                Err(e) => {
                    self.control_protocol_error(id, e);
                    return;
                }
            };
            trace!("Control {id} issued '{}'.", command.name());
            if !self.execute(id, command) {
                return;
            }
        }
    }

    /// Runs one command. Returns false once the control connection is gone.
    fn execute(&mut self, id: ConnId, command: ControlCommand) -> bool {
        match command {
            ControlCommand::Broadcast { payload, binary } => {
                self.send_broadcast(&payload, binary);
            }
            ControlCommand::Direct {
                token,
                payload,
                binary,
                confirm,
            } => self.direct(id, token, &payload, binary, confirm),
            ControlCommand::Lock { token } => self.lock(id, token),
            ControlCommand::Fragment { kind, payload } => self.fragment(id, kind, &payload),
            ControlCommand::LeastLoaded => {
                if let Some(listener) = self.registry.least_loaded() {
                    let reply = ControlReply::Domain(listener.domain.clone());
                    self.reply(id, reply);
                }
            }
            ControlCommand::Ping => self.reply(id, ControlReply::Pong),
            ControlCommand::Pong => {
                if let Some(conn) = self.controls.get_mut(&id) {
                    conn.flags.insert(ConnFlags::ALIVE);
                }
            }
            ControlCommand::Quit => {
                debug!("Control {id} quit.");
                self.finalize_control(id);
                return false;
            }
            ControlCommand::Unknown(code) => {
                debug!("Control {id} sent unknown command {:?}; skipped.", code as char);
            }
        }
        true
    }

    fn direct(&mut self, id: ConnId, token: Bytes, payload: &[u8], binary: bool, confirm: bool) {
        let destination = self
            .relations
            .get(&token)
            .filter(|dest| self.registry.is_ready(*dest));
        let (attempted, delivered) = match destination {
            Some(dest) if !payload.is_empty() => (true, self.send_direct(payload, dest, binary)),
            // An empty message only asks whether the client is ready.
            Some(_) => (false, true),
            None => (false, false),
        };
        if confirm || attempted {
            let reply = if delivered {
                ControlReply::Ack(token)
            } else {
                ControlReply::Nack(token)
            };
            self.reply(id, reply);
        }
    }

    fn lock(&mut self, id: ConnId, token: Bytes) {
        if self.locks.holds_lock(id) && self.live_lock_target(id).is_none() {
            self.locks.release(id);
            debug!("Control {id} lost its locked client; lock dropped.");
        }
        let target = self
            .relations
            .get(&token)
            .filter(|dest| self.registry.is_ready(*dest));
        match target {
            Some(target) if !self.locks.holds_lock(id) => {
                self.registry.set_ready(target, false);
                self.locks.lock(id, token.clone(), target);
                debug!("Control {id} locked client {target}.");
                self.reply(id, ControlReply::Ack(token));
            }
            _ => self.reply(id, ControlReply::Nack(token)),
        }
    }

    fn fragment(&mut self, id: ConnId, kind: FragmentKind, payload: &[u8]) {
        let Some(target) = self.live_lock_target(id) else {
            if self.locks.release(id).is_some() {
                debug!("Control {id} lost its locked client; lock dropped.");
            }
            self.reply(id, ControlReply::FragmentNack);
            return;
        };

        if let Some(conn) = self.registry.get_mut(target) {
            conn.outbox.write(encode_frame(kind.first_byte(), payload));
            if kind.is_last() {
                let restore = !conn
                    .flags
                    .intersects(ConnFlags::CLOSING | ConnFlags::CLOSED);
                self.locks.release(id);
                if restore {
                    self.registry.set_ready(target, true);
                }
                debug!("Control {id} finished its fragmented send to client {target}.");
            }
        }
        self.reply(id, ControlReply::FragmentAck);
    }

    /// The client locked by `id`. A lock only stays valid while its token
    /// still maps to the client it was taken on.
    fn live_lock_target(&self, id: ConnId) -> Option<ConnId> {
        self.locks
            .get(id)
            .filter(|entry| self.relations.get(&entry.token) == Some(entry.target))
            .map(|entry| entry.target)
            .filter(|target| self.registry.contains(*target))
    }

    fn reply(&mut self, id: ConnId, reply: ControlReply) {
        if let Some(conn) = self.controls.get_mut(&id) {
            conn.outbox.write(reply.to_bytes());
        }
    }

    fn control_protocol_error(&mut self, id: ConnId, error: RelayError) {
        let Some(conn) = self.controls.get_mut(&id) else {
            return;
        };
        warn!("Control {id} ({}) broke protocol: {error}", conn.peer);
        conn.outbox.write(ControlReply::ProtocolError.to_bytes());
        conn.flags.insert(ConnFlags::CLOSED);
        conn.buffer.clear();
        metrics::PROTOCOL_ERRORS_TOTAL
            .with_label_values(&["control"])
            .inc();
    }

    pub(super) fn control_writable(&mut self, id: ConnId, flushed: u64) {
        let closed = self
            .controls
            .get(&id)
            .is_some_and(|c| c.outbox.is_drained_at(flushed) && c.flags.contains(ConnFlags::CLOSED));
        if closed {
            self.finalize_control(id);
        }
    }

    pub(super) fn control_timeout(&mut self, id: ConnId) {
        let Some(conn) = self.controls.get_mut(&id) else {
            return;
        };
        if conn.flags.contains(ConnFlags::CLOSED) || !conn.flags.contains(ConnFlags::ALIVE) {
            debug!("Control {id} timed out.");
            self.finalize_control(id);
            return;
        }
        conn.flags.remove(ConnFlags::ALIVE);
        conn.outbox.write(ControlReply::Ping.to_bytes());
    }

    /// Tears a control connection down, closing any client it was streaming
    /// a fragmented message to.
    pub(super) fn finalize_control(&mut self, id: ConnId) {
        let Some(conn) = self.controls.remove(&id) else {
            return;
        };
        conn.outbox.shutdown();
        metrics::CONTROL_CONNECTIONS.dec();
        debug!("Control connection {id} ({}) closed.", conn.peer);

        let Some(entry) = self.locks.release(id) else {
            return;
        };
        let now = self.clock.now();
        if let Some(target) = self.registry.get_mut(entry.target) {
            warn!(
                "Control {id} dropped mid-message; closing client {}.",
                entry.target
            );
            target.begin_closing(now);
            target
                .outbox
                .write(close_frame(CLOSE_INTERNAL_ERROR, "framesource lost"));
            self.registry.set_ready(entry.target, false);
        }
    }
}
