//! # Oplog
//!
//! A generic operation-log replication agent. The agent ingests
//! mutation notifications for an external application's objects,
//! durably appends them to a bounded log, keeps a latest-state snapshot
//! per object, and streams both live operations and historical
//! snapshots to many concurrent subscribers with resumable cursors.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Ingest Layer                          │
//! │  • UDP source parses JSON datagrams into operations         │
//! │  • Bounded channel; producers drop on overflow              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Ingestor                             │
//! │  • Appends to the capped op-log, upserts latest state       │
//! │  • Indefinite retry with backoff; session refresh           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   OpStore (Memory / Redis)                  │
//! │  • Capped, insertion-ordered op-log with tailable reads     │
//! │  • Uncapped state collection ordered by append time         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Tailer (one per subscriber)                 │
//! │  • live-tail ↔ replicate state machine, cursor resume       │
//! │  • fallback when a cursor aged out of the capped log        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                    SSE transport (axum)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use oplog::{Oplog, OplogConfig, SseServer, UdpSource};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = OplogConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         ..Default::default()
//!     };
//!     let oplog = Arc::new(Oplog::new(config).await?);
//!     let cancel = CancellationToken::new();
//!
//!     let (ops_tx, ops_rx) = oplog.ingest_channel();
//!     tokio::spawn(oplog.ingestor().run(ops_rx, cancel.clone()));
//!
//!     let udp = UdpSource::new(
//!         oplog.config().udp_addr.clone(),
//!         oplog.config().max_datagram_bytes,
//!         ops_tx,
//!         Arc::clone(oplog.stats()),
//!     );
//!     tokio::spawn(udp.run(cancel.clone()));
//!
//!     SseServer::new(oplog).run(cancel).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`agent`]: The [`Oplog`] coordinator wiring everything together
//! - [`storage`]: Storage backends behind the [`OpStore`] trait
//! - [`ingest`]: The ingest task (append + state upsert, never drops)
//! - [`tailer`]: Per-subscriber live-tail/replicate state machine
//! - [`differ`]: Reconciling an external dump against stored state
//! - [`ident`]: Operation ids and subscriber cursors
//! - [`sse`] / [`udp`]: HTTP/SSE and UDP transports
//! - [`resilience`]: Retry with exponential backoff

pub mod agent;
pub mod config;
pub mod differ;
pub mod filter;
pub mod ident;
pub mod ingest;
pub mod metrics;
pub mod operation;
pub mod resilience;
pub mod sse;
pub mod stats;
pub mod storage;
pub mod tailer;
pub mod udp;

pub use agent::Oplog;
pub use config::OplogConfig;
pub use differ::{diff, OperationDataMap};
pub use filter::Filter;
pub use ident::{CursorError, LastId, OpId};
pub use ingest::{IngestOp, Ingestor};
pub use operation::{EventKind, ObjectState, Operation, OperationData, StreamEvent, UrlTemplate};
pub use resilience::retry::RetryConfig;
pub use sse::SseServer;
pub use stats::{Stats, StatsSnapshot};
pub use storage::memory::MemoryStore;
pub use storage::redis::RedisStore;
pub use storage::traits::{OpStore, StateCursor, StateEvents, StoreError, TailChunk};
pub use tailer::Tailer;
pub use udp::UdpSource;
