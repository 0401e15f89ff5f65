// src/core/errors.rs

//! Defines the primary error type for the relay engine.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing every failure the engine can hit while
/// processing a single connection. None of these are fatal to the process;
/// the offending connection is answered (where possible) and torn down.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Read buffer limit of {0} bytes reached")]
    BufferOverflow(usize),

    #[error("Frame payload of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: u64, limit: usize },

    #[error("Invalid control frame: {0}")]
    InvalidControlFrame(String),
}

// `std::io::Error` is not cloneable, so it is shared behind an Arc.
impl Clone for RelayError {
    fn clone(&self) -> Self {
        match self {
            RelayError::Io(e) => RelayError::Io(Arc::clone(e)),
            RelayError::BufferOverflow(n) => RelayError::BufferOverflow(*n),
            RelayError::FrameTooLarge { len, limit } => RelayError::FrameTooLarge {
                len: *len,
                limit: *limit,
            },
            RelayError::InvalidControlFrame(s) => RelayError::InvalidControlFrame(s.clone()),
        }
    }
}

impl PartialEq for RelayError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RelayError::Io(e1), RelayError::Io(e2)) => e1.to_string() == e2.to_string(),
            (RelayError::BufferOverflow(a), RelayError::BufferOverflow(b)) => a == b,
            (
                RelayError::FrameTooLarge { len: l1, limit: m1 },
                RelayError::FrameTooLarge { len: l2, limit: m2 },
            ) => l1 == l2 && m1 == m2,
            (RelayError::InvalidControlFrame(s1), RelayError::InvalidControlFrame(s2)) => s1 == s2,
            _ => false,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(Arc::new(e))
    }
}
