//! Operation ingestor.
//!
//! One task consumes the bounded ingest channel and performs the two
//! writes per operation: the op-log append, then the state upsert. Both
//! retry indefinitely with exponential backoff, refreshing the store
//! session between attempts; an operation accepted into the channel is
//! never dropped. The two writes are intentionally not transactional:
//! replication tolerates the gap (replicate reads state, live-tail
//! reads the log), so nothing is gained by coupling their availability.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::operation::{unix_millis, EventKind, ObjectState, Operation, OperationData};
use crate::resilience::retry::{Backoff, RetryConfig};
use crate::stats::Stats;
use crate::storage::traits::OpStore;

/// A parsed operation waiting to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOp {
    pub event: EventKind,
    pub data: OperationData,
}

pub struct Ingestor {
    store: Arc<dyn OpStore>,
    stats: Arc<Stats>,
    retry: RetryConfig,
}

impl Ingestor {
    #[must_use]
    pub fn new(store: Arc<dyn OpStore>, stats: Arc<Stats>) -> Self {
        Self {
            store,
            stats,
            retry: RetryConfig::ingest(),
        }
    }

    /// Consume operations until the channel closes or the token fires.
    ///
    /// The stop signal is observed between operations and between
    /// backoff sleeps; a store call already in flight completes first.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, mut ops: mpsc::Receiver<IngestOp>, cancel: CancellationToken) {
        info!("ingestor started");
        loop {
            let op = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = ops.recv() => match received {
                    Some(op) => op,
                    None => break,
                },
            };
            self.stats.set_queue_size(ops.len());
            if !self.write(op, &cancel).await {
                break;
            }
        }
        info!("ingestor stopped");
    }

    /// Append + upsert one operation. Returns false when shutdown
    /// interrupted a retry sleep.
    async fn write(&self, op: IngestOp, cancel: &CancellationToken) -> bool {
        debug!(
            event = %op.event,
            key = %op.data.key(),
            "ingesting operation"
        );

        let appended = match self.persist("append_op", cancel, || async {
            self.store.append_op(op.event, op.data.clone()).await
        }).await {
            Some(op) => op,
            None => return false,
        };

        let state = state_for(&appended);
        let upserted = self.persist("upsert_state", cancel, || async {
            self.store.upsert_state(state.clone()).await
        }).await;
        if upserted.is_none() {
            return false;
        }

        self.stats.event_ingested();
        true
    }

    /// Retry a store write until it succeeds, refreshing the session and
    /// backing off between attempts. Returns None only on shutdown.
    async fn persist<T, F, Fut>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::storage::traits::StoreError>>,
    {
        let mut backoff = Backoff::new(&self.retry);
        loop {
            match attempt().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(
                        operation = name,
                        error = %e,
                        retry_in = ?backoff.current_delay(),
                        "store write failed, will reconnect and retry"
                    );
                    crate::metrics::record_store_retry(name);
                    self.store.reset_session().await;
                    if !backoff.sleep_unless_cancelled(cancel).await {
                        warn!(operation = name, "shutdown during retry, operation not persisted");
                        return None;
                    }
                }
            }
        }
    }
}

/// State record for an appended operation: updates collapse into
/// inserts, and `ts` is the append wall clock, not the source time.
fn state_for(op: &Operation) -> ObjectState {
    ObjectState {
        id: op.data.key(),
        event: op.event.normalized(),
        ts: unix_millis(),
        data: op.data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::storage::memory::MemoryStore;
    use crate::storage::traits::{StateCursor, StateEvents};

    fn data(object_type: &str, object_id: &str, ts: i64) -> OperationData {
        OperationData {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            parents: vec![],
            timestamp: ts,
            ref_url: None,
        }
    }

    async fn ingest_all(store: Arc<MemoryStore>, ops: Vec<IngestOp>) -> Arc<Stats> {
        let stats = Arc::new(Stats::new());
        let (tx, rx) = mpsc::channel(16);
        for op in ops {
            tx.send(op).await.unwrap();
        }
        drop(tx); // channel close ends the run loop
        let ingestor = Ingestor::new(store as Arc<dyn OpStore>, Arc::clone(&stats));
        ingestor.run(rx, CancellationToken::new()).await;
        stats
    }

    #[tokio::test]
    async fn test_both_writes_land() {
        let store = Arc::new(MemoryStore::new());
        store.init(u64::MAX).await.unwrap();

        let stats = ingest_all(
            Arc::clone(&store),
            vec![IngestOp { event: EventKind::Insert, data: data("video", "v1", 10) }],
        )
        .await;

        assert_eq!(stats.snapshot().events_ingested, 1);
        assert_eq!(store.op_count(), 1);
        let states = store
            .read_states(&StateCursor::from_ts(0), i64::MAX, &Filter::new(), StateEvents::All, 10)
            .await
            .unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, "video/v1");
        assert_eq!(states[0].data, data("video", "v1", 10));
    }

    #[tokio::test]
    async fn test_update_collapses_into_insert() {
        let store = Arc::new(MemoryStore::new());
        store.init(u64::MAX).await.unwrap();

        ingest_all(
            Arc::clone(&store),
            vec![
                IngestOp { event: EventKind::Insert, data: data("video", "v1", 1) },
                IngestOp { event: EventKind::Update, data: data("video", "v1", 2) },
                IngestOp { event: EventKind::Update, data: data("video", "v1", 3) },
            ],
        )
        .await;

        let states = store
            .read_states(&StateCursor::from_ts(0), i64::MAX, &Filter::new(), StateEvents::All, 10)
            .await
            .unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].event, EventKind::Insert);
        assert_eq!(states[0].data.timestamp, 3);
    }

    #[tokio::test]
    async fn test_delete_becomes_tombstone() {
        let store = Arc::new(MemoryStore::new());
        store.init(u64::MAX).await.unwrap();

        ingest_all(
            Arc::clone(&store),
            vec![
                IngestOp { event: EventKind::Insert, data: data("video", "v1", 1) },
                IngestOp { event: EventKind::Delete, data: data("video", "v1", 2) },
            ],
        )
        .await;

        let states = store
            .read_states(&StateCursor::from_ts(0), i64::MAX, &Filter::new(), StateEvents::All, 10)
            .await
            .unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].event, EventKind::Delete);
    }

    #[tokio::test]
    async fn test_state_ts_is_append_clock_not_source_time() {
        let store = Arc::new(MemoryStore::new());
        store.init(u64::MAX).await.unwrap();

        let before = unix_millis();
        ingest_all(
            Arc::clone(&store),
            vec![IngestOp { event: EventKind::Insert, data: data("video", "v1", 12345) }],
        )
        .await;

        let states = store
            .read_states(&StateCursor::from_ts(0), i64::MAX, &Filter::new(), StateEvents::All, 10)
            .await
            .unwrap();
        assert!(states[0].ts >= before);
        assert_eq!(states[0].data.timestamp, 12345);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_loop() {
        let store = Arc::new(MemoryStore::new());
        store.init(u64::MAX).await.unwrap();
        let stats = Arc::new(Stats::new());
        let (tx, rx) = mpsc::channel::<IngestOp>(16);
        let cancel = CancellationToken::new();

        let ingestor = Ingestor::new(store as Arc<dyn OpStore>, stats);
        let handle = tokio::spawn(ingestor.run(rx, cancel.clone()));

        cancel.cancel();
        handle.await.unwrap();
        drop(tx);
    }
}
