// src/core/engine/mod.rs

//! The sans-IO relay engine.
//!
//! One `Engine` owns every table: the client registry, control connections,
//! token relations, fragment locks and the broadcast queue. The reactor task
//! feeds it socket events; the engine answers by pushing `Outbound`
//! instructions into each connection's outbox. Nothing here awaits.

mod client;
mod control;

use crate::config::{Config, LimitsConfig, TimeoutsConfig};
use crate::core::auth::TokenAuthenticator;
use crate::core::broadcast::BroadcastQueue;
use crate::core::clock::{Clock, SystemClock};
use crate::core::hooks::{NoopHooks, RelayHooks};
use crate::core::metrics;
use crate::core::protocol::control_frame::ControlCodec;
use crate::core::protocol::ws_frame::{WsFrameCodec, data_frame};
use crate::core::state::{
    ClientConn, ConnFlags, ConnId, ControlConn, LockTable, Outbound, Outbox, Registry,
    RelationTable,
};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Everything the engine needs from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub origins: Vec<String>,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutsConfig,
    pub authenticator: TokenAuthenticator,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            origins: config.origins.clone(),
            limits: config.limits.clone(),
            timeouts: config.timeouts.clone(),
            authenticator: TokenAuthenticator::new(
                config.secret.clone(),
                config.auth.token_lifetime,
                config.auth.clock_skew,
            ),
        }
    }

    fn keepalive_secs(&self) -> i64 {
        self.timeouts.keepalive.as_secs() as i64
    }
}

pub struct Engine<H: RelayHooks = NoopHooks> {
    settings: EngineSettings,
    registry: Registry,
    controls: BTreeMap<ConnId, ControlConn>,
    relations: RelationTable,
    locks: LockTable,
    broadcast: BroadcastQueue,
    next_id: ConnId,
    clock: Box<dyn Clock>,
    hooks: H,
    frame_codec: WsFrameCodec,
    control_codec: ControlCodec,
}

impl<H: RelayHooks> Engine<H> {
    /// Creates an engine with one listener per advertised domain, in order.
    pub fn new(settings: EngineSettings, domains: Vec<String>, hooks: H) -> Self {
        let frame_codec = WsFrameCodec::new(settings.limits.frame_buffer);
        let control_codec = ControlCodec::new(settings.limits.control_buffer);
        Self {
            settings,
            registry: Registry::new(domains),
            controls: BTreeMap::new(),
            relations: RelationTable::default(),
            locks: LockTable::default(),
            broadcast: BroadcastQueue::new(),
            next_id: 1,
            clock: Box::new(SystemClock),
            hooks,
            frame_codec,
            control_codec,
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Raises the start hook. An error aborts startup.
    pub fn start(&mut self) -> anyhow::Result<()> {
        self.hooks.on_start()
    }

    fn allocate_id(&mut self) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Registers a client socket accepted by listener `listener`.
    pub fn accept_client(
        &mut self,
        listener: usize,
        peer: String,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> ConnId {
        let id = self.allocate_id();
        let outbox = Outbox::new(tx);
        outbox.set_idle_timeout(self.settings.timeouts.handshake);
        debug!("Client {id} connected from {peer} on listener {listener}.");
        self.registry
            .insert(ClientConn::new(id, listener, peer, outbox));
        metrics::CONNECTED_CLIENTS.inc();
        metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
        id
    }

    /// Registers a control-plane socket.
    pub fn accept_control(&mut self, peer: String, tx: mpsc::UnboundedSender<Outbound>) -> ConnId {
        let id = self.allocate_id();
        let outbox = Outbox::new(tx);
        outbox.set_idle_timeout(self.settings.timeouts.control_keepalive);
        debug!("Control connection {id} opened from {peer}.");
        self.controls.insert(id, ControlConn::new(id, peer, outbox));
        metrics::CONTROL_CONNECTIONS.inc();
        id
    }

    /// Bytes arrived on a connection.
    pub fn on_readable(&mut self, id: ConnId, data: &[u8]) {
        if self.registry.contains(id) {
            self.client_readable(id, data);
        } else if self.controls.contains_key(&id) {
            self.control_readable(id, data);
        } else {
            trace!("Ignoring {} bytes for unknown connection {id}.", data.len());
        }
    }

    /// The socket task flushed `flushed` writes in total.
    pub fn on_writable(&mut self, id: ConnId, flushed: u64) {
        if self.registry.contains(id) {
            self.client_writable(id, flushed);
        } else if self.controls.contains_key(&id) {
            self.control_writable(id, flushed);
        }
    }

    /// The connection saw no inbound data for its idle interval.
    pub fn on_timeout(&mut self, id: ConnId) {
        if self.registry.contains(id) {
            self.client_timeout(id);
        } else if self.controls.contains_key(&id) {
            self.control_timeout(id);
        }
    }

    /// The socket failed or reached EOF. Safe to call more than once.
    pub fn on_error(&mut self, id: ConnId) {
        if self.registry.contains(id) {
            self.finalize_client(id);
        } else if self.controls.contains_key(&id) {
            self.finalize_control(id);
        }
    }

    /// Queues a message for every READY client.
    pub fn send_broadcast(&mut self, payload: &[u8], binary: bool) {
        metrics::BROADCASTS_QUEUED_TOTAL.inc();
        self.broadcast
            .push(data_frame(payload, binary), &mut self.registry);
    }

    /// Writes a message to one client right away. Fails, without queueing,
    /// when the destination is not a live READY connection.
    pub fn send_direct(&mut self, payload: &[u8], destination: ConnId, binary: bool) -> bool {
        let conn = match self.registry.get_mut(destination) {
            Some(conn) if conn.flags.contains(ConnFlags::READY) => conn,
            _ => {
                metrics::DIRECT_SENDS_TOTAL.with_label_values(&["failed"]).inc();
                return false;
            }
        };
        conn.outbox.write(data_frame(payload, binary));
        metrics::DIRECT_SENDS_TOTAL.with_label_values(&["ok"]).inc();
        true
    }

    /// Tells every socket task to close. Used on process shutdown.
    pub fn shutdown_all(&mut self) {
        let clients = self.registry.ids();
        for id in clients {
            self.finalize_client(id);
        }
        let controls: Vec<ConnId> = self.controls.keys().copied().collect();
        for id in controls {
            self.finalize_control(id);
        }
    }

    pub fn client_flags(&self, id: ConnId) -> Option<ConnFlags> {
        self.registry.get(id).map(|c| c.flags)
    }

    pub fn control_flags(&self, id: ConnId) -> Option<ConnFlags> {
        self.controls.get(&id).map(|c| c.flags)
    }

    pub fn relation(&self, token: &[u8]) -> Option<ConnId> {
        self.relations.get(token)
    }

    /// The client a control connection currently holds a fragment lock on.
    pub fn lock_target(&self, control: ConnId) -> Option<ConnId> {
        self.locks.get(control).map(|entry| entry.target)
    }

    pub fn pending_broadcasts(&self) -> usize {
        self.broadcast.len()
    }

    pub fn broadcast_pointer(&self) -> Option<ConnId> {
        self.broadcast.pointer()
    }

    pub fn listener_loads(&self) -> Vec<usize> {
        self.registry.listeners().iter().map(|l| l.load).collect()
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn control_count(&self) -> usize {
        self.controls.len()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }
}
