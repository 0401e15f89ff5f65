// src/connection/mod.rs

//! Socket tasks: one per accepted connection. They move bytes between the
//! socket and the reactor task and never touch engine state themselves.

mod guard;
mod handler;

pub use guard::ConnectionGuard;
pub use handler::ConnectionHandler;

use crate::core::state::ConnId;
use crate::server::AnyStream;
use bytes::Bytes;

/// Which listener a socket came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A client listener, by index.
    Client(usize),
    Control,
}

/// Everything the reactor task learns about sockets.
pub enum ReactorEvent {
    Accepted {
        origin: Origin,
        peer: String,
        stream: AnyStream,
    },
    Readable {
        id: ConnId,
        data: Bytes,
    },
    /// The socket task has flushed `flushed` writes since it started.
    Drained {
        id: ConnId,
        flushed: u64,
    },
    Timeout {
        id: ConnId,
    },
    Closed {
        id: ConnId,
    },
}
