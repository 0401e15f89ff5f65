// src/core/mod.rs

//! The central module containing the protocol engine of the relay.

pub mod auth;
pub mod broadcast;
pub mod clock;
pub mod engine;
pub mod errors;
pub mod hooks;
pub mod metrics;
pub mod protocol;
pub mod state;

pub use engine::{Engine, EngineSettings};
pub use errors::RelayError;
pub use hooks::{ClientHandle, NoopHooks, RelayHooks};
