// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! UDP ingest source.
//!
//! Receives JSON datagrams describing mutations and feeds them into the
//! bounded ingest channel. UDP semantics are best effort end to end:
//! malformed datagrams are counted and discarded, and a full queue drops
//! the datagram rather than blocking the socket loop.
//!
//! # Datagram format
//!
//! ```json
//! {"event": "INSERT", "type": "video", "id": "x34uzp",
//!  "parents": ["user/xl2d"], "timestamp": 1735776000000}
//! ```
//!
//! `event` is case-insensitive; `parents` defaults to empty and
//! `timestamp` to the receive time.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingest::IngestOp;
use crate::operation::{unix_millis, EventKind, OperationData};
use crate::stats::Stats;

#[derive(Debug, Error)]
pub enum UdpSourceError {
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Datagram parse/validation failure. Counted, never surfaced.
#[derive(Debug, Error)]
enum DatagramError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event type {0:?}")]
    UnknownEvent(String),
    #[error("empty object id")]
    EmptyId,
}

/// Raw wire shape of one datagram.
#[derive(Debug, Deserialize)]
struct Datagram {
    event: String,
    #[serde(rename = "type")]
    object_type: String,
    id: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

pub struct UdpSource {
    addr: String,
    max_datagram: usize,
    ops: mpsc::Sender<IngestOp>,
    stats: Arc<Stats>,
}

impl UdpSource {
    #[must_use]
    pub fn new(
        addr: impl Into<String>,
        max_datagram: usize,
        ops: mpsc::Sender<IngestOp>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            addr: addr.into(),
            max_datagram,
            ops,
            stats,
        }
    }

    /// Bind and receive until the token fires.
    #[tracing::instrument(skip(self, cancel), fields(addr = %self.addr))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), UdpSourceError> {
        let socket = UdpSocket::bind(&self.addr)
            .await
            .map_err(|e| UdpSourceError::Bind { address: self.addr.clone(), source: e })?;
        info!("UDP ingest source listening");

        let mut buf = vec![0u8; self.max_datagram];
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            self.stats.event_received();
                            self.handle_datagram(&buf[..len], peer);
                        }
                        Err(e) => {
                            warn!(error = %e, "UDP recv error");
                        }
                    }
                }
            }
        }

        info!("UDP ingest source stopped");
        Ok(())
    }

    fn handle_datagram(&self, bytes: &[u8], peer: std::net::SocketAddr) {
        let op = match parse_datagram(bytes) {
            Ok(op) => op,
            Err(e) => {
                self.stats.event_error();
                debug!(peer = %peer, error = %e, "discarding invalid datagram");
                return;
            }
        };

        match self.ops.try_send(op) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Queue full: drop the datagram, the ingestor never does.
                self.stats.event_discarded();
                debug!(peer = %peer, "ingest queue full, datagram dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("ingest channel closed");
            }
        }
    }
}

fn parse_datagram(bytes: &[u8]) -> Result<IngestOp, DatagramError> {
    let datagram: Datagram = serde_json::from_slice(bytes)?;
    let event = EventKind::parse(&datagram.event)
        .ok_or_else(|| DatagramError::UnknownEvent(datagram.event.clone()))?;
    if datagram.id.is_empty() {
        return Err(DatagramError::EmptyId);
    }
    Ok(IngestOp {
        event,
        data: OperationData {
            object_type: datagram.object_type,
            object_id: datagram.id,
            parents: datagram.parents,
            timestamp: datagram.timestamp.unwrap_or_else(unix_millis),
            ref_url: None,
        },
    })
}
