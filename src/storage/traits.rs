use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::filter::Filter;
use crate::ident::OpId;
use crate::operation::{EventKind, ObjectState, Operation, OperationData};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("malformed stored record: {0}")]
    Corrupt(String),
}

/// Outcome of one blocking tail read on the op-log.
#[derive(Debug)]
pub enum TailChunk {
    /// Operations scanned since the cursor, already filtered.
    /// `last_seen` is the highest op id the read advanced past,
    /// matching or not, so the caller's cursor skips filtered-out
    /// operations instead of rescanning them.
    Ops {
        ops: Vec<Operation>,
        last_seen: OpId,
    },
    /// The wait elapsed with no new data. Not an error; re-tail.
    TimedOut,
    /// The op-log holds no operations at all. Callers back off before
    /// retrying instead of spinning on an empty log.
    EmptyLog,
}

/// Tombstone visibility for state reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvents {
    /// Inserts and delete tombstones.
    All,
    /// Inserts only; a fresh sync has no database to delete from.
    InsertsOnly,
}

/// Resume point for paged state reads.
///
/// States are ordered by `(ts, id)`; the cursor selects everything
/// strictly after `(ts, after_id)` when `after_id` is set, and
/// everything with `ts >= ts` otherwise. The id tiebreak is what lets
/// a caller page past more same-millisecond states than fit in one
/// page; a bare `ts + 1` advance would drop the rest of the tie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCursor {
    pub ts: i64,
    pub after_id: Option<String>,
}

impl StateCursor {
    /// Start of the replay window: every state with `ts >= ts`.
    #[must_use]
    pub fn from_ts(ts: i64) -> Self {
        Self { ts, after_id: None }
    }

    /// The position just past an already-read state.
    #[must_use]
    pub fn after(state: &ObjectState) -> Self {
        Self {
            ts: state.ts,
            after_id: Some(state.id.clone()),
        }
    }

    /// Whether a state lies past this cursor in `(ts, id)` order.
    #[inline]
    #[must_use]
    pub fn admits(&self, state: &ObjectState) -> bool {
        state.ts > self.ts
            || (state.ts == self.ts
                && self
                    .after_id
                    .as_deref()
                    .map_or(true, |id| state.id.as_str() > id))
    }
}

/// Abstract durable layer: a capped, insertion-ordered op-log plus an
/// uncapped latest-state collection keyed by `type/id`.
///
/// Implementations guarantee:
/// - op ids are strictly increasing in insertion order;
/// - the op-log evicts oldest entries once `max_bytes` is exceeded,
///   states are never evicted;
/// - [`tail_ops`](OpStore::tail_ops) preserves insertion order;
/// - [`read_states`](OpStore::read_states) is sorted by `(ts, id)`
///   ascending. Pages are not consistent against concurrent writes;
///   callers advance with [`StateCursor::after`] the last item, which
///   both excludes re-reads of the page boundary and pages through
///   timestamp ties larger than one page.
#[async_trait]
pub trait OpStore: Send + Sync {
    /// Idempotently create the capped op-log (size bound `max_bytes`)
    /// and the state store. Failure here is fatal to the agent.
    async fn init(&self, max_bytes: u64) -> Result<(), StoreError>;

    /// Assign the next id and persist the operation.
    async fn append_op(
        &self,
        event: EventKind,
        data: OperationData,
    ) -> Result<Operation, StoreError>;

    /// Replace or insert the state by its `type/id` key. A delete
    /// tombstone survives an insert whose source timestamp is older
    /// than the tombstone's.
    async fn upsert_state(&self, state: ObjectState) -> Result<(), StoreError>;

    /// Membership test against the capped op-log.
    async fn has_op(&self, id: OpId) -> Result<bool, StoreError>;

    /// Id of the most recently appended operation, if any.
    async fn last_op_id(&self) -> Result<Option<OpId>, StoreError>;

    /// Read operations with `id > after` in insertion order, blocking
    /// up to `wait` when no new data is available. `after = None` reads
    /// from the start of the log.
    async fn tail_ops(
        &self,
        after: Option<OpId>,
        filter: &Filter,
        wait: Duration,
    ) -> Result<TailChunk, StoreError>;

    /// One page of states past `from` with `ts <= ts_to` matching the
    /// filter, sorted by `(ts, id)` ascending, at most `limit` items.
    async fn read_states(
        &self,
        from: &StateCursor,
        ts_to: i64,
        filter: &Filter,
        events: StateEvents,
        limit: usize,
    ) -> Result<Vec<ObjectState>, StoreError>;

    /// Refresh the backend session after an error. Each consumer holds
    /// the store behind an `Arc` and calls this before backing off.
    async fn reset_session(&self);
}
