//! Metrics instrumentation for the oplog agent.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the
//! embedding process chooses the exporter (Prometheus, OTEL, etc.).
//! The authoritative counters for the `/status` endpoint live in
//! [`crate::stats::Stats`]; this module mirrors them onto the facade
//! and adds store-level instrumentation.
//!
//! # Metric Naming Convention
//! - `oplog_` prefix for all metrics
//! - `_total` suffix for counters

use metrics::{counter, gauge};

/// Record a durably ingested operation.
pub fn record_ingested() {
    counter!("oplog_events_ingested_total").increment(1);
}

/// Record an invalid ingest payload.
pub fn record_ingest_error() {
    counter!("oplog_events_error_total").increment(1);
}

/// Record a datagram dropped on ingest queue overflow.
pub fn record_discarded() {
    counter!("oplog_events_discarded_total").increment(1);
}

/// Record an event delivered to a subscriber stream.
pub fn record_sent() {
    counter!("oplog_events_sent_total").increment(1);
}

/// Set current ingest queue depth.
pub fn set_queue_size(depth: u64) {
    gauge!("oplog_queue_size").set(depth as f64);
}

/// Set current connected subscriber count.
pub fn set_clients(clients: i64) {
    gauge!("oplog_clients").set(clients as f64);
}

/// Record a store operation retry after a transient error.
pub fn record_store_retry(operation: &str) {
    counter!(
        "oplog_store_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a tail session error (subscriber stream will back off).
pub fn record_tail_error(mode: &'static str) {
    counter!(
        "oplog_tail_errors_total",
        "mode" => mode
    )
    .increment(1);
}
