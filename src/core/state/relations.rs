// src/core/state/relations.rs

//! Token-to-connection relations and the fragmented-send lock table.

use super::connection::ConnId;
use bytes::Bytes;
use std::collections::HashMap;

/// Maps each auth token to the single live connection using it.
#[derive(Debug, Default)]
pub struct RelationTable {
    by_token: HashMap<Bytes, ConnId>,
}

impl RelationTable {
    /// Registers a relation. Returns false, leaving the table untouched, when
    /// the token is already bound to a live connection.
    pub fn insert(&mut self, token: Bytes, id: ConnId) -> bool {
        if self.by_token.contains_key(&token) {
            return false;
        }
        self.by_token.insert(token, id);
        true
    }

    pub fn get(&self, token: &[u8]) -> Option<ConnId> {
        self.by_token.get(token).copied()
    }

    pub fn contains(&self, token: &[u8]) -> bool {
        self.by_token.contains_key(token)
    }

    /// Removes the relation for `token` if it still points at `id`.
    pub fn remove(&mut self, token: &[u8], id: ConnId) {
        if self.get(token) == Some(id) {
            self.by_token.remove(token);
        }
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

/// An exclusive fragmented-send session held by a control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub token: Bytes,
    /// The client connection the token resolved to when the lock was taken.
    pub target: ConnId,
}

/// Which control connection holds a lock on which client.
#[derive(Debug, Default)]
pub struct LockTable {
    by_control: HashMap<ConnId, LockEntry>,
}

impl LockTable {
    pub fn lock(&mut self, control: ConnId, token: Bytes, target: ConnId) {
        self.by_control.insert(control, LockEntry { token, target });
    }

    pub fn get(&self, control: ConnId) -> Option<&LockEntry> {
        self.by_control.get(&control)
    }

    pub fn holds_lock(&self, control: ConnId) -> bool {
        self.by_control.contains_key(&control)
    }

    pub fn release(&mut self, control: ConnId) -> Option<LockEntry> {
        self.by_control.remove(&control)
    }

    pub fn len(&self) -> usize {
        self.by_control.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_control.is_empty()
    }
}
