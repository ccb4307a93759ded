//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define secure channel metrics (handshakes, waits, interrupts, connections)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `secure_channel_handshakes_total` (counter): handshakes by outcome
//! - `secure_channel_waits_total` (counter): readiness waits by op and direction
//! - `secure_channel_interrupts_total` (counter): interrupt passes that ran actions
//! - `secure_channel_supervisor_deaths_total` (counter): connections terminated
//! - `secure_channel_context_inits_total` (counter): TLS context builds by outcome
//! - `secure_channel_key_file_rejections_total` (counter): rejected keys by reason
//! - `secure_channel_active_connections` (gauge): current connection count
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Labels are static strings to keep cardinality bounded

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::net::socket::{IoDirection, WaitFor};

/// Install the Prometheus exporter and its HTTP listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_handshake(outcome: &'static str) {
    ::metrics::counter!("secure_channel_handshakes_total", "outcome" => outcome).increment(1);
}

pub fn record_wait(op: IoDirection, wait_for: WaitFor) {
    ::metrics::counter!(
        "secure_channel_waits_total",
        "op" => op.as_str(),
        "direction" => wait_for.as_str()
    )
    .increment(1);
}

pub fn record_interrupt(op: IoDirection, may_block: bool) {
    let may_block = if may_block { "true" } else { "false" };
    ::metrics::counter!(
        "secure_channel_interrupts_total",
        "op" => op.as_str(),
        "may_block" => may_block
    )
    .increment(1);
}

pub fn record_supervisor_death() {
    ::metrics::counter!("secure_channel_supervisor_deaths_total").increment(1);
}

pub fn record_context_init(outcome: &'static str) {
    ::metrics::counter!("secure_channel_context_inits_total", "outcome" => outcome).increment(1);
}

pub fn record_key_file_rejected(reason: &'static str) {
    ::metrics::counter!("secure_channel_key_file_rejections_total", "reason" => reason)
        .increment(1);
}

pub fn connection_opened() {
    ::metrics::gauge!("secure_channel_active_connections").increment(1.0);
}

pub fn connection_closed() {
    ::metrics::gauge!("secure_channel_active_connections").decrement(1.0);
}
