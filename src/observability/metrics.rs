//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_tasks_active` (gauge): handshake + dispatch tasks in flight
//! - `gateway_handshake_failures_total` (counter): by `kind`
//! - `gateway_queries_total` (counter): by `outcome`
//! - `gateway_http_sessions` (gauge): entries in the session cache
//! - `gateway_sessions_evicted_total` (counter): idle evictions
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels are static strings only

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_task_started() {
    metrics::gauge!("gateway_tasks_active").increment(1.0);
}

pub fn record_task_finished() {
    metrics::gauge!("gateway_tasks_active").decrement(1.0);
}

pub fn record_handshake_failure(kind: &'static str) {
    metrics::counter!("gateway_handshake_failures_total", "kind" => kind).increment(1);
}

pub fn record_query(outcome: &'static str) {
    metrics::counter!("gateway_queries_total", "outcome" => outcome).increment(1);
}

pub fn record_http_sessions(count: usize) {
    metrics::gauge!("gateway_http_sessions").set(count as f64);
}

pub fn record_sessions_evicted(count: usize) {
    metrics::counter!("gateway_sessions_evicted_total").increment(count as u64);
}
