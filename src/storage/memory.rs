//! In-memory store: a byte-budgeted ring for the op-log and a
//! concurrent map for states.
//!
//! Used by the test suite and for single-process embedding. Tailing
//! blocks on a [`Notify`] that append signals, so live subscribers see
//! new operations without polling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::traits::{OpStore, StateCursor, StateEvents, StoreError, TailChunk};
use crate::filter::Filter;
use crate::ident::{OpId, OpIdGenerator};
use crate::operation::{unix_millis, EventKind, ObjectState, Operation, OperationData};

pub struct MemoryStore {
    log: Mutex<OpLogRing>,
    states: DashMap<String, ObjectState>,
    ids: OpIdGenerator,
    notify: Notify,
    max_bytes: AtomicU64,
}

#[derive(Default)]
struct OpLogRing {
    ops: VecDeque<Operation>,
    bytes: u64,
}

/// Approximate footprint of one stored operation.
fn op_cost(op: &Operation) -> u64 {
    let data = &op.data;
    (std::mem::size_of::<Operation>()
        + data.object_type.len()
        + data.object_id.len()
        + data.parents.iter().map(String::len).sum::<usize>()
        + data.ref_url.as_ref().map_or(0, String::len)) as u64
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: Mutex::new(OpLogRing::default()),
            states: DashMap::new(),
            ids: OpIdGenerator::new(),
            notify: Notify::new(),
            max_bytes: AtomicU64::new(u64::MAX),
        }
    }

    /// Number of operations currently in the capped log.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.log.lock().ops.len()
    }

    /// Number of stored states (tombstones included).
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Collect operations with `id > after` that match the filter,
    /// along with the highest id scanned. None when nothing is newer.
    fn collect_after(
        &self,
        after: Option<OpId>,
        filter: &Filter,
    ) -> CollectOutcome {
        let log = self.log.lock();
        if log.ops.is_empty() {
            return CollectOutcome::Empty;
        }
        // Ops are appended in id order, so a binary search finds the
        // resume point.
        let start = match after {
            None => 0,
            Some(id) => match log.ops.binary_search_by(|op| op.id.cmp(&id)) {
                Ok(pos) => pos + 1,
                Err(pos) => pos,
            },
        };
        if start >= log.ops.len() {
            return CollectOutcome::NothingNew;
        }
        let ops: Vec<Operation> = log
            .ops
            .range(start..)
            .filter(|op| filter.matches(&op.data))
            .cloned()
            .collect();
        let last_seen = log.ops.back().expect("non-empty log").id;
        CollectOutcome::Scanned { ops, last_seen }
    }
}

enum CollectOutcome {
    Empty,
    NothingNew,
    Scanned { ops: Vec<Operation>, last_seen: OpId },
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OpStore for MemoryStore {
    async fn init(&self, max_bytes: u64) -> Result<(), StoreError> {
        self.max_bytes.store(max_bytes.max(1), Ordering::Release);
        Ok(())
    }

    async fn append_op(
        &self,
        event: EventKind,
        data: OperationData,
    ) -> Result<Operation, StoreError> {
        let op = Operation {
            id: self.ids.next(unix_millis() as u64),
            event,
            data,
        };
        {
            let mut log = self.log.lock();
            log.bytes += op_cost(&op);
            log.ops.push_back(op.clone());
            // Capped: evict oldest, but never the entry just appended.
            let max = self.max_bytes.load(Ordering::Acquire);
            while log.bytes > max && log.ops.len() > 1 {
                if let Some(evicted) = log.ops.pop_front() {
                    log.bytes -= op_cost(&evicted);
                }
            }
        }
        self.notify.notify_waiters();
        Ok(op)
    }

    async fn upsert_state(&self, state: ObjectState) -> Result<(), StoreError> {
        match self.states.entry(state.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let current = existing.get();
                // A tombstone outlives an insert carrying an older
                // source timestamp (stale dump replay).
                if current.event == EventKind::Delete
                    && state.event == EventKind::Insert
                    && state.data.timestamp < current.data.timestamp
                {
                    return Ok(());
                }
                existing.insert(state);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(state);
            }
        }
        Ok(())
    }

    async fn has_op(&self, id: OpId) -> Result<bool, StoreError> {
        let log = self.log.lock();
        Ok(log.ops.binary_search_by(|op| op.id.cmp(&id)).is_ok())
    }

    async fn last_op_id(&self) -> Result<Option<OpId>, StoreError> {
        Ok(self.log.lock().ops.back().map(|op| op.id))
    }

    async fn tail_ops(
        &self,
        after: Option<OpId>,
        filter: &Filter,
        wait: Duration,
    ) -> Result<TailChunk, StoreError> {
        let deadline = Instant::now() + wait;
        loop {
            // Register for wakeups before checking, so an append between
            // the check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.collect_after(after, filter) {
                CollectOutcome::Empty => return Ok(TailChunk::EmptyLog),
                CollectOutcome::Scanned { ops, last_seen } => {
                    return Ok(TailChunk::Ops { ops, last_seen });
                }
                CollectOutcome::NothingNew => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(TailChunk::TimedOut);
            }
        }
    }

    async fn read_states(
        &self,
        from: &StateCursor,
        ts_to: i64,
        filter: &Filter,
        events: StateEvents,
        limit: usize,
    ) -> Result<Vec<ObjectState>, StoreError> {
        let mut page: Vec<ObjectState> = self
            .states
            .iter()
            .filter(|entry| {
                let s = entry.value();
                from.admits(s)
                    && s.ts <= ts_to
                    && (events == StateEvents::All || s.event != EventKind::Delete)
                    && filter.matches(&s.data)
            })
            .map(|entry| entry.value().clone())
            .collect();
        page.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));
        page.truncate(limit);
        Ok(page)
    }

    async fn reset_session(&self) {}
}
