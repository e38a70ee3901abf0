//! Property-based tests for cursor parsing and the differ.
//!
//! Uses proptest to generate random inputs and verify the agent never
//! panics and the documented invariants hold.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashMap;

use proptest::prelude::*;

use oplog::{
    diff, EventKind, Filter, LastId, MemoryStore, ObjectState, OpStore, OperationData,
    OperationDataMap, StateCursor, StateEvents,
};

// =============================================================================
// Strategies
// =============================================================================

/// A plausible live-state population: unique object ids with arbitrary
/// source timestamps.
fn live_states_strategy() -> impl Strategy<Value = Vec<OperationData>> {
    prop::collection::hash_map("[a-z]{1,8}", 0i64..1_000_000, 0..50).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(id, ts)| OperationData {
                object_type: "video".to_string(),
                object_id: id,
                parents: vec![],
                timestamp: ts,
                ref_url: None,
            })
            .collect()
    })
}

fn seed_and_run(
    states: &[OperationData],
    mut create: OperationDataMap,
) -> (OperationDataMap, OperationDataMap, OperationDataMap) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    runtime.block_on(async {
        let store = MemoryStore::new();
        store.init(u64::MAX).await.unwrap();
        for (i, data) in states.iter().enumerate() {
            store
                .upsert_state(ObjectState {
                    id: data.key(),
                    event: EventKind::Insert,
                    ts: i as i64,
                    data: data.clone(),
                })
                .await
                .unwrap();
        }
        let mut update = HashMap::new();
        let mut delete = HashMap::new();
        diff(&store, &mut create, &mut update, &mut delete)
            .await
            .unwrap();
        (create, update, delete)
    })
}

// =============================================================================
// Cursor parsing
// =============================================================================

proptest! {
    /// Cursor parsing never panics on arbitrary input.
    #[test]
    fn fuzz_cursor_parse_never_panics(input in ".{0,64}") {
        let _ = LastId::parse(&input);
    }

    /// Dispatch is deterministic by length and charset: short digit
    /// strings are replication cursors, 24-hex strings are operation
    /// ids, and nothing parses as both.
    #[test]
    fn prop_cursor_dispatch_is_deterministic(input in "[0-9a-f]{1,32}") {
        match LastId::parse(&input) {
            Ok(LastId::Replication { .. }) => {
                prop_assert!(input.len() <= 13);
                prop_assert!(input.bytes().all(|b| b.is_ascii_digit()));
            }
            Ok(LastId::Operation(_)) => {
                prop_assert_eq!(input.len(), 24);
            }
            Err(_) => {
                let digits = input.bytes().all(|b| b.is_ascii_digit());
                prop_assert!(!(digits && input.len() <= 13) && input.len() != 24);
            }
        }
    }

    /// A rendered cursor parses back to an equivalent resume position
    /// (the server-side fallback flag does not travel).
    #[test]
    fn prop_cursor_render_parse(millis in 0u64..(1u64 << 48), seq in any::<u32>(), ts in 0i64..9_999_999_999_999) {
        let op = LastId::Operation(oplog::OpId::new(millis, seq));
        prop_assert_eq!(LastId::parse(&op.to_string()).unwrap(), op);

        let repl = LastId::Replication { ts, fallback: false };
        prop_assert_eq!(LastId::parse(&repl.to_string()).unwrap(), repl);
    }
}

// =============================================================================
// Datagram parsing
// =============================================================================

proptest! {
    /// Wire event parsing never panics and only accepts the three kinds.
    #[test]
    fn fuzz_event_kind_parse(input in ".{0,16}") {
        match EventKind::parse(&input) {
            Some(kind) => prop_assert!(input.eq_ignore_ascii_case(kind.as_str())),
            None => {}
        }
    }
}

// =============================================================================
// Differ round trip
// =============================================================================

proptest! {
    /// A dump equal to a snapshot of all live states produces an empty
    /// delta in every direction.
    #[test]
    fn prop_differ_round_trip(states in live_states_strategy()) {
        let create: OperationDataMap =
            states.iter().map(|d| (d.key(), d.clone())).collect();
        let (create, update, delete) = seed_and_run(&states, create);

        prop_assert!(create.is_empty(), "create left: {:?}", create.keys());
        prop_assert!(update.is_empty(), "update left: {:?}", update.keys());
        prop_assert!(delete.is_empty(), "delete left: {:?}", delete.keys());
    }

    /// An empty dump never asks for creates or updates, and only ever
    /// deletes stored objects (it cannot invent ids).
    #[test]
    fn prop_differ_empty_dump(states in live_states_strategy()) {
        let stored: Vec<String> = states.iter().map(OperationData::key).collect();
        let (create, update, delete) = seed_and_run(&states, HashMap::new());

        prop_assert!(create.is_empty());
        prop_assert!(update.is_empty());
        for id in delete.keys() {
            prop_assert!(stored.contains(id));
        }
    }

    /// Post-conditions of the reconciliation: the three maps are
    /// disjoint, and every update's dump copy is strictly newer than
    /// what the store held.
    #[test]
    fn prop_differ_maps_disjoint(
        states in live_states_strategy(),
        bump in 1i64..1000,
    ) {
        // Dump = stored states with every timestamp bumped: everything
        // should land in update, nothing in create or delete.
        let create: OperationDataMap = states
            .iter()
            .map(|d| {
                let mut newer = d.clone();
                newer.timestamp += bump;
                (d.key(), newer)
            })
            .collect();
        let (create, update, delete) = seed_and_run(&states, create);

        prop_assert!(create.is_empty());
        prop_assert_eq!(update.len(), states.len());
        prop_assert!(delete.is_empty());
        for key in update.keys() {
            prop_assert!(!create.contains_key(key));
            prop_assert!(!delete.contains_key(key));
        }
    }
}

// =============================================================================
// Filter invariants
// =============================================================================

proptest! {
    /// An empty filter matches everything; a type filter matches
    /// exactly the named types.
    #[test]
    fn prop_filter_type_fidelity(
        object_type in "[a-z]{1,8}",
        allowed in prop::collection::vec("[a-z]{1,8}", 0..5),
    ) {
        let data = OperationData {
            object_type: object_type.clone(),
            object_id: "x".to_string(),
            parents: vec![],
            timestamp: 0,
            ref_url: None,
        };
        prop_assert!(Filter::new().matches(&data));

        let filter = Filter::from_lists(allowed.clone(), vec![]);
        if allowed.is_empty() {
            prop_assert!(filter.matches(&data));
        } else {
            prop_assert_eq!(filter.matches(&data), allowed.contains(&object_type));
        }
    }
}

// =============================================================================
// Store invariants
// =============================================================================

proptest! {
    /// Appended ids are strictly increasing regardless of load shape,
    /// and the newest entry always survives the cap.
    #[test]
    fn prop_append_ids_strictly_increase(count in 1usize..100, max_bytes in 128u64..4096) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let store = MemoryStore::new();
            store.init(max_bytes).await.unwrap();

            let mut last = None;
            for i in 0..count {
                let op = store
                    .append_op(
                        EventKind::Insert,
                        OperationData {
                            object_type: "video".to_string(),
                            object_id: format!("v{i}"),
                            parents: vec![],
                            timestamp: i as i64,
                            ref_url: None,
                        },
                    )
                    .await
                    .unwrap();
                if let Some(prev) = last {
                    assert!(op.id > prev, "ids must strictly increase");
                }
                last = Some(op.id);
            }

            let newest = last.unwrap();
            assert!(store.has_op(newest).await.unwrap());
            assert_eq!(store.last_op_id().await.unwrap(), Some(newest));

            // States are never capped: none were written here, so
            // the read must simply be empty rather than error.
            let states = store
                .read_states(&StateCursor::from_ts(0), i64::MAX, &Filter::new(), StateEvents::All, 10)
                .await
                .unwrap();
            assert!(states.is_empty());
        });
    }
}
