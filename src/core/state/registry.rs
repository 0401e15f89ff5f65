// src/core/state/registry.rs

//! The registry of live client connections and the listeners that own them.

use super::connection::{ClientConn, ConnFlags, ConnId};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};

/// A bound front-end socket as seen by load discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    /// The address advertised to clients routed to this listener.
    pub domain: String,
    /// Live connections accepted by this listener.
    pub load: usize,
}

/// Owns every client connection.
///
/// READY connections are mirrored in an ordered set so broadcast fan-out can
/// walk them in id order without touching the rest. `set_ready` is the only
/// way to flip the READY flag, which keeps flag and set in step.
#[derive(Debug, Default)]
pub struct Registry {
    clients: BTreeMap<ConnId, ClientConn>,
    ready: BTreeSet<ConnId>,
    listeners: Vec<Listener>,
}

impl Registry {
    pub fn new(domains: Vec<String>) -> Self {
        Self {
            clients: BTreeMap::new(),
            ready: BTreeSet::new(),
            listeners: domains
                .into_iter()
                .map(|domain| Listener { domain, load: 0 })
                .collect(),
        }
    }

    pub fn insert(&mut self, conn: ClientConn) {
        if let Some(listener) = self.listeners.get_mut(conn.listener) {
            listener.load += 1;
        }
        if conn.flags.contains(ConnFlags::READY) {
            self.ready.insert(conn.id);
        }
        self.clients.insert(conn.id, conn);
    }

    pub fn remove(&mut self, id: ConnId) -> Option<ClientConn> {
        let conn = self.clients.remove(&id)?;
        self.ready.remove(&id);
        if let Some(listener) = self.listeners.get_mut(conn.listener) {
            listener.load = listener.load.saturating_sub(1);
        }
        Some(conn)
    }

    pub fn get(&self, id: ConnId) -> Option<&ClientConn> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut ClientConn> {
        self.clients.get_mut(&id)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_ready(&self, id: ConnId) -> bool {
        self.ready.contains(&id)
    }

    pub fn set_ready(&mut self, id: ConnId, ready: bool) {
        let Some(conn) = self.clients.get_mut(&id) else {
            return;
        };
        conn.flags.set(ConnFlags::READY, ready);
        if ready {
            self.ready.insert(id);
        } else {
            self.ready.remove(&id);
        }
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn first_ready(&self) -> Option<ConnId> {
        self.ready.first().copied()
    }

    pub fn next_ready_after(&self, id: ConnId) -> Option<ConnId> {
        self.ready.range((Excluded(id), Unbounded)).next().copied()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.clients.keys().copied().collect()
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// The listener with the fewest live connections; the first one wins ties.
    pub fn least_loaded(&self) -> Option<&Listener> {
        self.listeners.iter().min_by_key(|l| l.load)
    }
}
