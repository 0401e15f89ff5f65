// src/core/metrics.rs

//! Defines and registers Prometheus metrics for relay monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Gauges ---
    /// The number of WebSocket clients currently connected.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("wsrelay_connected_clients", "Number of currently connected WebSocket clients.").unwrap();
    /// The number of control-plane connections currently open.
    pub static ref CONTROL_CONNECTIONS: Gauge =
        register_gauge!("wsrelay_control_connections", "Number of currently open control connections.").unwrap();
    /// Broadcast messages waiting for fan-out.
    pub static ref BROADCAST_QUEUE_DEPTH: Gauge =
        register_gauge!("wsrelay_broadcast_queue_depth", "Broadcast messages not yet delivered to every client.").unwrap();

    // --- Counters ---
    /// The total number of client sockets accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("wsrelay_connections_received_total", "Total number of client connections received.").unwrap();
    /// Handshake outcomes, labeled by HTTP status.
    pub static ref HANDSHAKES_TOTAL: CounterVec =
        register_counter_vec!("wsrelay_handshakes_total", "Total number of upgrade handshakes, labeled by status.", &["status"]).unwrap();
    /// Broadcast messages accepted from control connections.
    pub static ref BROADCASTS_QUEUED_TOTAL: Counter =
        register_counter!("wsrelay_broadcasts_queued_total", "Total number of broadcast messages queued.").unwrap();
    /// Individual broadcast frames written to clients.
    pub static ref BROADCAST_DELIVERIES_TOTAL: Counter =
        register_counter!("wsrelay_broadcast_deliveries_total", "Total number of broadcast frames handed to clients.").unwrap();
    /// Direct sends, labeled by outcome.
    pub static ref DIRECT_SENDS_TOTAL: CounterVec =
        register_counter_vec!("wsrelay_direct_sends_total", "Total number of direct sends, labeled by outcome.", &["outcome"]).unwrap();
    /// Connections torn down for violating the protocol, labeled by plane.
    pub static ref PROTOCOL_ERRORS_TOTAL: CounterVec =
        register_counter_vec!("wsrelay_protocol_errors_total", "Total number of protocol errors, labeled by plane.", &["plane"]).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
