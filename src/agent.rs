//! Agent coordinator.
//!
//! [`Oplog`] ties the pieces together: it owns the storage backend and
//! the shared counters, and hands out the ingest channel, the ingestor
//! task, and per-subscriber tailers. One `Arc<Oplog>` is shared by the
//! UDP source and the SSE server.
//!
//! # Example
//!
//! ```rust,no_run
//! use oplog::{Filter, Oplog, OplogConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), oplog::StoreError> {
//! let config = OplogConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     ..Default::default()
//! };
//! let oplog = std::sync::Arc::new(Oplog::new(config).await?);
//!
//! let cancel = CancellationToken::new();
//! let (ops_tx, ops_rx) = oplog.ingest_channel();
//! tokio::spawn(oplog.ingestor().run(ops_rx, cancel.clone()));
//! # let _ = ops_tx;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::OplogConfig;
use crate::differ::{self, OperationDataMap};
use crate::filter::Filter;
use crate::ingest::{IngestOp, Ingestor};
use crate::operation::UrlTemplate;
use crate::stats::Stats;
use crate::storage::memory::MemoryStore;
use crate::storage::redis::RedisStore;
use crate::storage::traits::{OpStore, StoreError};
use crate::tailer::Tailer;

pub struct Oplog {
    store: Arc<dyn OpStore>,
    stats: Arc<Stats>,
    config: OplogConfig,
}

impl Oplog {
    /// Connect the backend selected by the config and initialize it.
    ///
    /// An init failure (cannot create or reach the collections) is
    /// fatal: the agent must not start half-wired.
    pub async fn new(config: OplogConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn OpStore> = match config.redis_url {
            Some(ref url) => {
                info!(url = %url, "connecting oplog store (redis)");
                Arc::new(RedisStore::with_prefix(url, config.redis_prefix.as_deref()).await?)
            }
            None => {
                info!("using in-memory oplog store");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(store, config).await
    }

    /// Wire an already-constructed backend (tests, embedding).
    pub async fn with_store(
        store: Arc<dyn OpStore>,
        config: OplogConfig,
    ) -> Result<Self, StoreError> {
        store.init(config.max_bytes).await?;
        Ok(Self {
            store,
            stats: Arc::new(Stats::new()),
            config,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn OpStore> {
        &self.store
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    #[must_use]
    pub fn config(&self) -> &OplogConfig {
        &self.config
    }

    /// The bounded ingest channel. Producers `try_send` and count a
    /// discard on overflow; the ingestor never drops.
    #[must_use]
    pub fn ingest_channel(&self) -> (mpsc::Sender<IngestOp>, mpsc::Receiver<IngestOp>) {
        mpsc::channel(self.config.ingest_queue)
    }

    /// The single ingest task for this agent.
    #[must_use]
    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(Arc::clone(&self.store), Arc::clone(&self.stats))
    }

    /// A tail session for one subscriber, configured from the agent.
    #[must_use]
    pub fn tailer(&self, filter: Filter) -> Tailer {
        let template = self
            .config
            .object_url_template
            .as_ref()
            .map(UrlTemplate::new);
        Tailer::new(Arc::clone(&self.store), filter)
            .with_template(template)
            .with_page_size(self.config.page_size)
            .with_tail_timeout(Duration::from_millis(self.config.tail_timeout_ms))
    }

    /// Reconcile an external dump against stored state; see
    /// [`differ::diff`].
    pub async fn diff(
        &self,
        create: &mut OperationDataMap,
        update: &mut OperationDataMap,
        delete: &mut OperationDataMap,
    ) -> Result<(), StoreError> {
        differ::diff(self.store.as_ref(), create, update, delete).await
    }
}
