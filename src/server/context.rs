// src/server/context.rs

use super::stream::{AnyListener, Endpoint};
use crate::config::Config;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the relay's main loop.
pub struct ServerContext {
    pub config: Config,
    /// Front-end listeners, in configuration order; the index is the
    /// listener id the engine reports loads for.
    pub listeners: Vec<AnyListener>,
    /// Taken by the spawner when the control accept loop starts.
    pub control: Option<AnyListener>,
    /// Every bound endpoint, so unix socket files can be removed on exit.
    pub endpoints: Vec<Endpoint>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
