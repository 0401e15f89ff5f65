// src/core/state/mod.rs

//! Connection state, the client registry and the token/lock tables.
//! All of it is owned by the engine and touched from a single task.

mod connection;
mod registry;
mod relations;

pub use connection::{ClientConn, ConnFlags, ConnId, ControlConn, Outbound, Outbox};
pub use registry::{Listener, Registry};
pub use relations::{LockEntry, LockTable, RelationTable};
