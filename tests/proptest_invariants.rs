//! Property-based tests for the universal invariants and concrete
//! end-to-end scenarios this index is required to satisfy.
//!
//! Invariants 1 (key-range) and 2 (separator) constrain internal node
//! structure that isn't observable through the public `BwTree` API; they
//! are exercised indirectly here by checking that iteration always yields
//! keys in strictly ascending order and that every inserted key is
//! reachable by `get_value` after arbitrarily many splits/merges/
//! consolidations — a violation of either internal invariant would show up
//! as a missing, duplicated, or misordered key at this level.

use std::collections::BTreeMap;

use bwtree_rs::tile_group::{LoggingBackend, TileGroupHeader, MAX_CID};
use bwtree_rs::BwTree;
use proptest::{collection::vec, prelude::*};

/// Best-effort tracing init for local debugging of a failing shrink;
/// harmless if another test in the same binary already installed one.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("bwtree_rs=debug").try_init();
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u64),
    Delete(u64, u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..200, 0u64..4).prop_map(|(k, v)| Op::Insert(k, v)),
        (0u64..200, 0u64..4).prop_map(|(k, v)| Op::Delete(k, v)),
    ]
}

proptest! {
    /// Invariant 3 (lookup idempotence) + invariants 1/2 observed
    /// indirectly: after a random sequence of inserts/deletes, replaying
    /// the same sequence against a plain `BTreeMap` multiset model and a
    /// `BwTree` must agree on every key's value set, and asking twice in a
    /// row must agree with itself.
    #[test]
    fn random_insert_delete_sequence_matches_multiset_model(ops in vec(op_strategy(), 1..300)) {
        let tree: BwTree<u64, u64> = BwTree::new();
        let mut model: BTreeMap<u64, Vec<u64>> = BTreeMap::new();

        for op in &ops {
            match *op {
                Op::Insert(k, v) => {
                    let existed = model.get(&k).map(|vs| vs.contains(&v)).unwrap_or(false);
                    let inserted = tree.insert(k, v);
                    prop_assert_eq!(inserted, !existed);
                    if !existed {
                        model.entry(k).or_default().push(v);
                    }
                }
                Op::Delete(k, v) => {
                    let existed = model.get(&k).map(|vs| vs.contains(&v)).unwrap_or(false);
                    let deleted = tree.delete(k, v);
                    prop_assert_eq!(deleted, existed);
                    if existed {
                        model.get_mut(&k).unwrap().retain(|x| *x != v);
                    }
                }
            }
        }

        for k in 0u64..200 {
            let mut expected = model.get(&k).cloned().unwrap_or_default();
            let mut got = tree.get_value(&k);
            expected.sort();
            got.sort();
            prop_assert_eq!(&got, &expected);
            // Invariant 3: asking again changes nothing.
            let mut got_again = tree.get_value(&k);
            got_again.sort();
            prop_assert_eq!(got, got_again);
        }

        // Iteration must be strictly ascending by key and must reproduce
        // exactly the live set the model predicts (indirect check of
        // invariants 1 and 2: a node whose keys strayed outside its
        // [lowKey, highKey) range, or a separator pointing at the wrong
        // child, would desync iteration order or drop/duplicate entries).
        let iterated: Vec<(u64, u64)> = tree.begin().collect();
        for w in iterated.windows(2) {
            prop_assert!(w[0].0 <= w[1].0);
        }
        let mut expected_pairs: Vec<(u64, u64)> = model
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (*k, *v)))
            .collect();
        let mut got_pairs = iterated;
        expected_pairs.sort();
        got_pairs.sort();
        prop_assert_eq!(expected_pairs, got_pairs);
    }
}

/// S1: start empty, insert `1..1000`, each value equal to its key.
#[test]
fn s1_sequential_fill_and_lookup() {
    let tree: BwTree<u64, u64> = BwTree::new();
    for k in 1..1000u64 {
        assert!(tree.insert(k, k));
    }
    for k in 1..1000u64 {
        assert_eq!(tree.get_value(&k), vec![k]);
    }
    assert_eq!(tree.get_value(&1001), Vec::<u64>::new());
}

/// S2: duplicate-pair rejection alongside distinct-value acceptance for
/// the same key.
#[test]
fn s2_duplicate_values_for_one_key() {
    let tree: BwTree<u64, &str> = BwTree::new();
    assert!(tree.insert(5, "a"));
    assert!(tree.insert(5, "b"));
    assert!(!tree.insert(5, "a"));
    let mut values = tree.get_value(&5);
    values.sort();
    assert_eq!(values, vec!["a", "b"]);
}

/// S3: insert then delete the same range; the tree converges back to a
/// single (or merge-satisfying) leaf layout and an empty iteration.
#[test]
fn s3_insert_then_delete_converges_empty() {
    let tree: BwTree<u64, u64> = BwTree::new();
    for k in 1..400u64 {
        assert!(tree.insert(k, k));
    }
    for k in 1..400u64 {
        assert!(tree.delete(k, k));
    }
    tree.perform_garbage_collection();
    assert!(tree.begin().next().is_none());
    for k in 1..400u64 {
        assert_eq!(tree.get_value(&k), Vec::<u64>::new());
    }
}

/// S5 (single-process approximation): two threads each insert `(k,
/// threadId)` across a disjoint-by-value but shared-by-key range; after
/// both complete and a GC pass, both values are present for every key.
#[test]
fn s5_two_writers_both_values_survive_a_gc_pass() {
    use std::sync::Arc;
    use std::thread;

    let tree: Arc<BwTree<u64, u64>> = Arc::new(BwTree::new());
    let t1 = {
        let tree = tree.clone();
        thread::spawn(move || {
            for k in 0..500u64 {
                tree.insert(k, 1);
            }
        })
    };
    let t2 = {
        let tree = tree.clone();
        thread::spawn(move || {
            for k in 0..500u64 {
                tree.insert(k, 2);
            }
        })
    };
    t1.join().unwrap();
    t2.join().unwrap();
    tree.perform_garbage_collection();

    let mut total = 0usize;
    for k in 0..500u64 {
        let mut values = tree.get_value(&k);
        values.sort();
        assert_eq!(values, vec![1, 2]);
        total += values.len();
    }
    assert_eq!(total, 1000);
}

/// S6: `ConditionalInsert` predicate-triggered, predicate-clear, and
/// duplicate-after-insert outcomes.
#[test]
fn s6_conditional_insert_outcomes() {
    let tree: BwTree<u64, u64> = BwTree::new();
    // No existing values yet, so the predicate has nothing to match: the
    // insert goes through.
    assert_eq!(tree.conditional_insert(42, 7, |v| *v > 100), (true, false));
    // Now `7` is on record and satisfies `> 5`: the predicate blocks the
    // new value `3` from being inserted.
    assert_eq!(tree.conditional_insert(42, 3, |v| *v > 5), (false, true));
    // The predicate clears (no existing value is `> 100`), but `(42, 7)`
    // already exists as an exact pair.
    assert_eq!(tree.conditional_insert(42, 7, |v| *v > 100), (false, false));
}

/// Invariant 9 (MVCC self-visibility): after `Acquire` and
/// `SetBeginCid(MAX)`, the owning transaction sees its own pending insert
/// at every commit id, and no other transaction sees it.
#[test]
fn invariant_9_mvcc_self_visibility() {
    let header = TileGroupHeader::new(1);
    let slot = header.reserve_slot().unwrap();
    assert!(header.acquire(slot, 11));
    header.set_begin_cid(slot, MAX_CID);

    for cid in [0u64, 1, 50, MAX_CID - 1, MAX_CID] {
        assert!(header.is_visible(slot, 11, cid));
        assert!(!header.is_visible(slot, 12, cid));
    }
}

/// Invariant 8 (visibility monotonicity): `IsVisible` is a pure function
/// of its inputs and current slot state — two calls with identical
/// arguments and no mutation in between agree.
#[test]
fn invariant_8_repeated_visibility_checks_agree() {
    let header = TileGroupHeader::with_logging_backend(1, LoggingBackend::WriteAhead);
    let slot = header.reserve_slot().unwrap();
    header.acquire(slot, 3);
    header.set_begin_cid(slot, 10);
    header.set_end_cid(slot, MAX_CID);
    header.set_insert_commit(slot, true);

    let first = header.is_visible(slot, 3, 10);
    let second = header.is_visible(slot, 3, 10);
    assert_eq!(first, second);
}

/// Invariants 6/7 (epoch safety, NodeID reuse safety) observed through
/// the public API: a long sequence of inserts/deletes that forces splits,
/// merges, and consolidations, interleaved with GC passes, must never
/// corrupt live data — which would be the visible symptom of reclaiming a
/// node or recycling a NodeID too early.
#[test]
fn stress_splits_merges_and_gc_preserve_live_data() {
    init_tracing();
    let config = bwtree_rs::BwTreeConfig::default()
        .with_split_threshold(16)
        .with_merge_threshold(4)
        .with_consolidate_threshold(3);
    let tree: BwTree<u64, u64> = BwTree::with_config(config);

    for round in 0..5u64 {
        let base = round * 1000;
        for i in 0..1000u64 {
            assert!(tree.insert(base + i, base + i));
        }
        tree.perform_garbage_collection();
        for i in (0..1000u64).step_by(3) {
            assert!(tree.delete(base + i, base + i));
        }
        tree.perform_garbage_collection();
        for i in 0..1000u64 {
            let key = base + i;
            let expected = if i % 3 == 0 { Vec::<u64>::new() } else { vec![key] };
            assert_eq!(tree.get_value(&key), expected);
        }
    }
}
