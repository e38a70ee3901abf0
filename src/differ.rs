// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dump reconciliation.
//!
//! [`diff`] compares a full external dump against the stored states and
//! sorts the delta into three maps: objects to create, objects whose
//! dump copy is newer, and objects to delete. The store is never
//! mutated; the caller replays the resulting maps through its own API.

use std::collections::{HashMap, HashSet};

use crate::filter::Filter;
use crate::operation::{EventKind, OperationData};
use crate::storage::traits::{OpStore, StateCursor, StateEvents, StoreError};

/// Dump / delta maps keyed by the canonical `type/id` string.
pub type OperationDataMap = HashMap<String, OperationData>;

/// Page size for the full state scan.
const SCAN_PAGE: usize = 1000;

/// Reconcile `create` (pre-populated with the full dump) against stored
/// state.
///
/// On return:
/// - `create` holds objects missing from storage,
/// - `update` holds objects whose dump copy is newer than the stored one,
/// - `delete` holds stored objects absent from the dump that predate it.
///
/// An object older than the newest dump timestamp but absent from the
/// dump is deleted; a newer one is left alone, since it may have been
/// created after the dump began. A tombstone whose dump copy predates
/// the deletion is dropped from `create` (the dump is stale); a
/// tombstone absent from the dump needs no delta at all.
pub async fn diff(
    store: &dyn OpStore,
    create: &mut OperationDataMap,
    update: &mut OperationDataMap,
    delete: &mut OperationDataMap,
) -> Result<(), StoreError> {
    let dump_time = create.values().map(|d| d.timestamp).max().unwrap_or(0);
    let filter = Filter::new();

    // The cursor's id tiebreak pages through timestamp ties wider than
    // one page; the seen set guards against states re-surfacing at a
    // bumped ts when the ingestor writes concurrently.
    let mut seen: HashSet<String> = HashSet::new();
    let mut cursor = StateCursor::from_ts(0);
    loop {
        let page = store
            .read_states(&cursor, i64::MAX, &filter, StateEvents::All, SCAN_PAGE)
            .await?;
        let full = page.len() == SCAN_PAGE;

        for state in &page {
            cursor = StateCursor::after(state);
            if !seen.insert(state.id.clone()) {
                continue;
            }

            if state.event == EventKind::Delete {
                if let Some(dumped) = create.get(&state.id) {
                    if dumped.timestamp < state.data.timestamp {
                        // Deleted after the dump was taken; the dump
                        // copy is stale.
                        create.remove(&state.id);
                    }
                }
            } else if let Some(dumped) = create.remove(&state.id) {
                if state.data.timestamp < dumped.timestamp {
                    update.insert(state.id.clone(), dumped);
                }
            } else if state.data.timestamp < dump_time {
                delete.insert(state.id.clone(), state.data.clone());
            }
        }

        if !full {
            break;
        }
    }
    Ok(())
}
