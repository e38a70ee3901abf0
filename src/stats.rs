//! Agent-wide counters surfaced for observability.
//!
//! The [`Stats`] struct is shared by the ingest side (UDP source,
//! ingestor) and the emit side (SSE connections). All fields are plain
//! atomics so hot paths never take a lock; [`Stats::snapshot`] reads
//! each counter independently, which is atomic enough for reporting
//! (exact cross-counter consistency is not required).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Stats {
    /// Datagrams received on the ingest socket, valid or not.
    pub events_received: AtomicU64,
    /// Operations durably written (op-log append + state upsert done).
    pub events_ingested: AtomicU64,
    /// Datagrams that failed to parse or validate.
    pub events_error: AtomicU64,
    /// Valid operations dropped because the ingest queue was full.
    pub events_discarded: AtomicU64,
    /// Current ingest queue depth (gauge, sampled by the ingestor).
    pub queue_size: AtomicU64,
    /// High-water mark of the ingest queue depth.
    pub queue_max_size: AtomicU64,
    /// Currently connected subscribers (gauge).
    pub clients: AtomicI64,
    /// Total subscriber connections accepted.
    pub connections: AtomicU64,
    /// Events written to subscriber streams.
    pub events_sent: AtomicU64,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn event_ingested(&self) {
        self.events_ingested.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_ingested();
    }

    #[inline]
    pub fn event_error(&self) {
        self.events_error.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_ingest_error();
    }

    #[inline]
    pub fn event_discarded(&self) {
        self.events_discarded.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_discarded();
    }

    /// Sample the ingest queue depth, tracking the high-water mark.
    #[inline]
    pub fn set_queue_size(&self, depth: usize) {
        let depth = depth as u64;
        self.queue_size.store(depth, Ordering::Relaxed);
        self.queue_max_size.fetch_max(depth, Ordering::Relaxed);
        crate::metrics::set_queue_size(depth);
    }

    /// A subscriber connected: bumps both the gauge and the total.
    #[inline]
    pub fn client_connected(&self) {
        let clients = self.clients.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.fetch_add(1, Ordering::Relaxed);
        crate::metrics::set_clients(clients);
    }

    #[inline]
    pub fn client_disconnected(&self) {
        let clients = self.clients.fetch_sub(1, Ordering::Relaxed) - 1;
        crate::metrics::set_clients(clients);
    }

    #[inline]
    pub fn event_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_sent();
    }

    /// Point-in-time view of all counters, for the status endpoint.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            events_error: self.events_error.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            queue_size: self.queue_size.load(Ordering::Relaxed),
            queue_max_size: self.queue_max_size.load(Ordering::Relaxed),
            clients: self.clients.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
        }
    }
}

/// Serializable counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub events_ingested: u64,
    pub events_error: u64,
    pub events_discarded: u64,
    pub queue_size: u64,
    pub queue_max_size: u64,
    pub clients: i64,
    pub connections: u64,
    pub events_sent: u64,
}
