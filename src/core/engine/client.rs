// src/core/engine/client.rs

//! The WebSocket client state machine: upgrade handshake, token expiry,
//! message dispatch, keepalive and teardown.

use super::Engine;
use crate::core::RelayError;
use crate::core::auth::VerifiedToken;
use crate::core::hooks::{ClientHandle, RelayHooks};
use crate::core::metrics;
use crate::core::protocol::handshake::{
    HandshakeRejection, HandshakeRequest, find_request_end, switching_protocols_response,
};
use crate::core::protocol::ws_frame::{
    CLOSE_NORMAL, OpCode, WsMessage, close_echo_frame, close_frame, ping_frame, pong_frame,
};
use crate::core::state::{ConnFlags, ConnId};
use bytes::Bytes;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

/// Where the handshake stands after new bytes arrived.
enum HandshakeStep {
    /// The request head is still incomplete.
    Pending,
    /// Upgraded; any bytes left in the buffer are WebSocket frames.
    Upgraded,
    /// Rejected with an HTTP error or torn down; stop processing.
    Stopped,
}

impl<H: RelayHooks> Engine<H> {
    pub(super) fn client_readable(&mut self, id: ConnId, data: &[u8]) {
        let now = self.clock.now();
        let keepalive = self.settings.keepalive_secs();
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if conn.flags.contains(ConnFlags::CLOSED) {
            // Waiting for its output to drain; input no longer matters.
            return;
        }
        if conn.closing_overdue(now, keepalive) {
            debug!("Client {id} did not answer its close frame in time.");
            self.finalize_client(id);
            return;
        }
        conn.buffer.extend_from_slice(data);

        if !conn.flags.contains(ConnFlags::HANDSHAKE_DONE) {
            match self.advance_handshake(id, now) {
                HandshakeStep::Upgraded => {}
                HandshakeStep::Pending | HandshakeStep::Stopped => return,
            }
        }

        self.check_expiry(id, now);
        self.decode_messages(id);
    }

    fn advance_handshake(&mut self, id: ConnId, now: i64) -> HandshakeStep {
        let cap = self.settings.limits.handshake_buffer;
        let Some(conn) = self.registry.get_mut(id) else {
            return HandshakeStep::Stopped;
        };
        let head = match find_request_end(&conn.buffer) {
            Some(end) if end < cap => conn.buffer.split_to(end).freeze(),
            None if conn.buffer.len() < cap => return HandshakeStep::Pending,
            _ => {
                warn!("Client {id} sent an upgrade request of {cap} bytes or more; closing.");
                metrics::PROTOCOL_ERRORS_TOTAL
                    .with_label_values(&["client"])
                    .inc();
                self.finalize_client(id);
                return HandshakeStep::Stopped;
            }
        };

        match self.authorize(&head, now) {
            Ok((key, verified)) => {
                self.complete_handshake(id, &key, verified);
                HandshakeStep::Upgraded
            }
            Err(rejection) => {
                self.reject_handshake(id, rejection);
                HandshakeStep::Stopped
            }
        }
    }

    /// Runs the checks in order: request syntax and headers, cookies, then
    /// token uniqueness. Returns the client key and the verified token.
    fn authorize(
        &self,
        head: &[u8],
        now: i64,
    ) -> Result<(String, VerifiedToken), HandshakeRejection> {
        let request = HandshakeRequest::parse(head)?;
        request.validate(&self.settings.origins)?;
        let verified = self
            .settings
            .authenticator
            .verify(&request.cookies, now)
            .map_err(|e| HandshakeRejection::Forbidden(e.to_string()))?;
        if self.relations.contains(verified.token.as_bytes()) {
            return Err(HandshakeRejection::TooManyRequests);
        }
        Ok((request.key.unwrap_or_default(), verified))
    }

    fn reject_handshake(&mut self, id: ConnId, rejection: HandshakeRejection) {
        let retry_after = self.settings.timeouts.keepalive.as_secs();
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        debug!(
            "Refusing upgrade from client {id} ({}) with {}: {rejection:?}",
            conn.peer,
            rejection.status()
        );
        conn.outbox.write(rejection.response(retry_after));
        conn.flags.insert(ConnFlags::CLOSED);
        conn.buffer.clear();
        metrics::HANDSHAKES_TOTAL
            .with_label_values(&[&rejection.status().to_string()])
            .inc();
    }

    fn complete_handshake(&mut self, id: ConnId, key: &str, verified: VerifiedToken) {
        let keepalive = self.settings.timeouts.keepalive;
        let token = Bytes::from(verified.token.into_bytes());
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        conn.outbox.write(switching_protocols_response(key));
        conn.outbox.set_idle_timeout(keepalive);
        conn.flags.insert(ConnFlags::HANDSHAKE_DONE);
        conn.expires_at = Some(verified.expires_at);
        conn.token = Some(token.clone());
        debug!("Client {id} upgraded; token valid until {}.", verified.expires_at);

        self.registry.set_ready(id, true);
        self.relations.insert(token, id);
        metrics::HANDSHAKES_TOTAL.with_label_values(&["101"]).inc();

        if let Some(conn) = self.registry.get_mut(id) {
            let mut handle = ClientHandle::new(id, &mut conn.outbox);
            self.hooks.on_handshake(&mut handle, id);
        }
    }

    /// Starts a relay-side close once the token has run out.
    fn check_expiry(&mut self, id: ConnId, now: i64) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if conn.flags.contains(ConnFlags::CLOSING) || !conn.is_token_expired(now) {
            return;
        }
        debug!("Token of client {id} expired; closing.");
        conn.begin_closing(now);
        conn.outbox.write(close_frame(CLOSE_NORMAL, "expired"));
        self.registry.set_ready(id, false);
    }

    fn decode_messages(&mut self, id: ConnId) {
        let cap = self.settings.limits.frame_buffer;
        let mut codec = self.frame_codec;
        loop {
            let Some(conn) = self.registry.get_mut(id) else {
                return;
            };
            if conn.flags.contains(ConnFlags::CLOSED) {
                return;
            }
            match codec.decode(&mut conn.buffer) {
                Ok(Some(message)) => {
                    if !self.dispatch_message(id, message) {
                        return;
                    }
                }
                Ok(None) => {
                    if conn.buffer.len() >= cap {
                        self.client_protocol_error(id, RelayError::BufferOverflow(cap));
                    }
                    return;
                }
                Err(e) => {
                    self.client_protocol_error(id, e);
                    return;
                }
            }
        }
    }

    /// Handles one complete message. Returns false once the connection is
    /// closed or gone and the rest of its buffer must be left alone.
    fn dispatch_message(&mut self, id: ConnId, message: WsMessage) -> bool {
        let WsMessage {
            opcode,
            mut payload,
        } = message;
        let Some(conn) = self.registry.get_mut(id) else {
            return false;
        };
        match opcode {
            OpCode::Text => {
                let mut handle = ClientHandle::new(id, &mut conn.outbox);
                self.hooks.on_text_message(&mut handle, id, &mut payload);
            }
            OpCode::Binary => {
                let mut handle = ClientHandle::new(id, &mut conn.outbox);
                self.hooks.on_binary_message(&mut handle, id, &mut payload);
            }
            OpCode::Close => {
                if conn.flags.contains(ConnFlags::CLOSING) {
                    debug!("Client {id} answered our close frame.");
                    self.finalize_client(id);
                    return false;
                }
                debug!("Client {id} sent a close frame.");
                conn.flags.insert(ConnFlags::CLOSED);
                conn.outbox.write(close_echo_frame(&payload));
                conn.buffer.clear();
                self.registry.set_ready(id, false);
                return false;
            }
            OpCode::Ping => conn.outbox.write(pong_frame(&payload)),
            OpCode::Pong => conn.flags.insert(ConnFlags::ALIVE),
            OpCode::Continuation | OpCode::Reserved(_) => {}
        }
        true
    }

    fn client_protocol_error(&mut self, id: ConnId, error: RelayError) {
        warn!("Closing client {id}: {error}");
        metrics::PROTOCOL_ERRORS_TOTAL
            .with_label_values(&["client"])
            .inc();
        self.finalize_client(id);
    }

    pub(super) fn client_writable(&mut self, id: ConnId, flushed: u64) {
        let Some(conn) = self.registry.get(id) else {
            return;
        };
        if !conn.outbox.is_drained_at(flushed) {
            return;
        }
        if conn.flags.contains(ConnFlags::CLOSED) {
            self.finalize_client(id);
            return;
        }
        self.broadcast.on_drained(id, &mut self.registry);
    }

    pub(super) fn client_timeout(&mut self, id: ConnId) {
        let now = self.clock.now();
        let keepalive = self.settings.keepalive_secs();
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let live = ConnFlags::HANDSHAKE_DONE | ConnFlags::ALIVE;
        if conn.closing_overdue(now, keepalive)
            || conn.flags.contains(ConnFlags::CLOSED)
            || !conn.flags.contains(live)
        {
            debug!("Client {id} timed out.");
            self.finalize_client(id);
            return;
        }
        conn.flags.remove(ConnFlags::ALIVE);
        conn.outbox.write(ping_frame());
    }

    /// Tears a client down. Idempotent: a second call finds nothing.
    pub(super) fn finalize_client(&mut self, id: ConnId) {
        let Some(conn) = self.registry.remove(id) else {
            return;
        };
        conn.outbox.shutdown();
        if let Some(token) = conn.token.as_deref() {
            self.relations.remove(token, id);
        }
        self.broadcast.on_closed(id, &mut self.registry);
        metrics::CONNECTED_CLIENTS.dec();
        debug!("Client {id} ({}) disconnected.", conn.peer);
    }
}
