//! `bwtree-rs` is a lock-free, in-memory ordered index suitable for an
//! MVCC database, together with its epoch-based memory reclamation
//! subsystem and a tile-group MVCC tuple header.
//!
//! The tree is a B+-tree variant ("Bw-Tree") where every node is a delta
//! chain terminated by a base node, addressed through a [`mapping_table`]
//! that maps a logical [`NodeID`](mapping_table::NodeID) to the current
//! head of its chain. All structural updates — inserting a delta,
//! consolidating a chain, splitting or merging a node, replacing the root
//! — are compare-and-swaps on a mapping-table slot; a failed CAS never
//! blocks, it just restarts traversal from the root ([`error::StructuralRetry`]).
//!
//! Nodes unlinked from the tree are not freed immediately: they travel
//! through the [`epoch`] manager's quiescent-state reclamation so that a
//! thread still mid-traversal can never have a chain pulled out from
//! under it. [`tile_group`] is an independent MVCC visibility header for
//! hosts that store tuple `ItemPointer`s as the index's values; the index
//! itself imposes no dependency on it.

mod config;
mod epoch;
mod error;
mod iter;
mod mapping_table;
mod node;
mod sorted_small_set;
pub mod tile_group;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use config::{
    BwTreeConfig, DEFAULT_CONSOLIDATE_THRESHOLD, DEFAULT_GC_TRIGGER, DEFAULT_MAPPING_TABLE_SIZE,
    DEFAULT_MAX_REGISTERED_THREADS, DEFAULT_MERGE_THRESHOLD, DEFAULT_SPLIT_THRESHOLD,
    MAX_THREAD_COUNT_SENTINEL,
};
pub use error::TileGroupError;
pub use iter::Iter;
pub use mapping_table::NodeID;

use epoch::{EpochManager, EpochToken, Garbage};
use error::{Retry, StructuralRetry};
use mapping_table::{MappingTable, FIRST_LEAF_NODE_ID, INVALID_NODE_ID, ROOT_NODE_ID};
use node::{
    consolidate_inner, consolidate_leaf, flatten_inner, flatten_leaf, InnerAbortDelta, InnerBase,
    InnerChain, InnerDeleteDelta, InnerInsertDelta, InnerMergeDelta, InnerRemoveDelta,
    InnerSplitDelta, LeafBase, LeafChain, LeafDeleteDelta, LeafInsertDelta, LeafMergeDelta,
    LeafRemoveDelta, LeafSplitDelta, PageNode,
};
use sorted_small_set::SortedSmallSet;

/// Seam for hosts that need an injected key comparator distinct from
/// `K`'s own [`Ord`] impl, mirroring the `keyCmp` closure of the index
/// factory the source system exposes to its (out-of-scope) SQL frontend.
/// `BwTree<K, V>` itself is generic over `K: Ord` directly — the common
/// case for byte-comparable keys — so this trait is a pluggable
/// alternative, not something the tree's internals consult.
pub trait KeyComparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> std::cmp::Ordering;
}

impl<K, F> KeyComparator<K> for F
where
    F: Fn(&K, &K) -> std::cmp::Ordering + Send + Sync,
{
    fn compare(&self, a: &K, b: &K) -> std::cmp::Ordering {
        self(a, b)
    }
}

/// Closure types mirroring the five comparator/hasher arguments an index
/// factory takes when keys and values are opaque byte blobs rather than
/// `Ord`/`Hash` Rust types. `BwTree<K, V>` does not take these itself (it
/// uses `K: Ord`/`V: PartialEq` directly); they exist as the seam a host
/// exposing an opaque-typed frontend would plug into its own wrapper.
pub type KeyCmp<K> = Box<dyn Fn(&K, &K) -> std::cmp::Ordering + Send + Sync>;
pub type KeyEq<K> = Box<dyn Fn(&K, &K) -> bool + Send + Sync>;
pub type KeyHash<K> = Box<dyn Fn(&K) -> u64 + Send + Sync>;
pub type ValEq<V> = Box<dyn Fn(&V, &V) -> bool + Send + Sync>;
pub type ValHash<V> = Box<dyn Fn(&V) -> u64 + Send + Sync>;

/// A lock-free, in-memory ordered multimap from `K` to `V`.
///
/// Every public operation joins the epoch manager on entry and leaves it
/// on return; `StructuralRetry` never escapes this type — internally a
/// CAS failure or an observed partial structure-modification (split,
/// merge, root replacement) restarts traversal from the root.
pub struct BwTree<K, V> {
    config: BwTreeConfig,
    mapping_table: Arc<MappingTable<K, V>>,
    epoch: Arc<EpochManager<K, V>>,
    /// The current root `NodeID`. Distinct from the fixed
    /// [`mapping_table::ROOT_NODE_ID`] slot the tree bootstraps with: a
    /// root split allocates a brand new id for the replacement root and
    /// swaps this field to it, leaving the old root as an ordinary inner
    /// node referenced from the new one.
    root_id: AtomicU64,
}

impl<K, V> BwTree<K, V>
where
    K: Ord + Clone + Default + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Builds an empty tree with the default [`BwTreeConfig`]. The host
    /// still drives reclamation itself by calling
    /// [`Self::perform_garbage_collection`]; see `DESIGN.md` for why this
    /// crate doesn't spin up a background thread for it.
    pub fn new() -> Self {
        Self::with_config(BwTreeConfig::default())
    }

    /// Builds an empty tree with explicit tuning parameters.
    pub fn with_config(config: BwTreeConfig) -> Self {
        let mapping_table = Arc::new(MappingTable::new(config.mapping_table_size));
        let epoch = EpochManager::new(
            config.max_registered_threads,
            config.gc_trigger,
            config.start_gc,
            mapping_table.clone(),
        );

        // Bootstrap: one empty leaf, one inner root containing it. The
        // leaf's low_key/the root's low_key are never consulted by
        // `find_child` (which falls back to `low_child` for "less than
        // every separator") — they exist only to satisfy the key-range
        // invariant's bookkeeping, so `K::default()` stands in for -infinity.
        let leaf = PageNode::Leaf(LeafChain::Base(LeafBase {
            low_key: K::default(),
            items: Vec::new(),
            high_key: None,
            next_sibling: INVALID_NODE_ID,
        }));
        mapping_table.install(FIRST_LEAF_NODE_ID, leaf);

        let root = PageNode::Inner(InnerChain::Base(InnerBase {
            low_key: K::default(),
            low_child: FIRST_LEAF_NODE_ID,
            seps: Vec::new(),
            high_key: None,
            next_sibling: INVALID_NODE_ID,
        }));
        mapping_table.install(ROOT_NODE_ID, root);

        tracing::info!(
            mapping_table_size = config.mapping_table_size,
            "bwtree constructed"
        );

        BwTree {
            config,
            mapping_table,
            epoch,
            root_id: AtomicU64::new(ROOT_NODE_ID),
        }
    }

    /// Inserts `(key, value)`. Returns `false` if the exact pair already
    /// exists; duplicates of `key` with a different `value` are allowed.
    pub fn insert(&self, key: K, value: V) -> bool {
        let token = self.epoch.join_epoch();
        let result = loop {
            match self.try_insert(&key, &value, &token) {
                Ok(r) => break r,
                Err(StructuralRetry) => continue,
            }
        };
        self.epoch.leave_epoch(token);
        result
    }

    /// Inserts `(key, value)` only if no existing value for `key`
    /// satisfies `predicate` and the exact pair does not already exist.
    /// Returns `(inserted, predicate_triggered)`.
    pub fn conditional_insert(&self, key: K, value: V, predicate: impl Fn(&V) -> bool) -> (bool, bool) {
        let token = self.epoch.join_epoch();
        let result = loop {
            match self.try_conditional_insert(&key, &value, &predicate, &token) {
                Ok(r) => break r,
                Err(StructuralRetry) => continue,
            }
        };
        self.epoch.leave_epoch(token);
        result
    }

    /// Removes the matching `(key, value)` pair. Returns `false` if no
    /// such pair exists.
    pub fn delete(&self, key: K, value: V) -> bool {
        let token = self.epoch.join_epoch();
        let result = loop {
            match self.try_delete(&key, &value, &token) {
                Ok(r) => break r,
                Err(StructuralRetry) => continue,
            }
        };
        self.epoch.leave_epoch(token);
        result
    }

    /// Collects every value currently associated with `key`, in
    /// delta-chain-replay order with duplicates suppressed.
    pub fn get_value(&self, key: &K) -> Vec<V> {
        let token = self.epoch.join_epoch();
        let result = loop {
            match self.try_get_value(key, &token) {
                Ok(r) => break r,
                Err(StructuralRetry) => continue,
            }
        };
        self.epoch.leave_epoch(token);
        result
    }

    /// A forward iterator starting at the first entry of the first leaf.
    pub fn begin(&self) -> Iter<K, V> {
        Iter::new(self.mapping_table.clone(), self.epoch.clone(), FIRST_LEAF_NODE_ID, None)
    }

    /// A forward iterator positioned on the first entry whose key is `>=
    /// key`.
    pub fn begin_at(&self, key: &K) -> Iter<K, V> {
        let token = self.epoch.join_epoch();
        let leaf_id = loop {
            match self.find_leaf(key, &token) {
                Ok((_, leaf_id)) => break leaf_id,
                Err(StructuralRetry) => continue,
            }
        };
        self.epoch.leave_epoch(token);
        Iter::new(self.mapping_table.clone(), self.epoch.clone(), leaf_id, Some(key))
    }

    /// True if any registered thread's garbage list has crossed the
    /// configured soft threshold. Hosts that construct the tree with
    /// `start_gc = false` should poll this and call
    /// [`Self::perform_garbage_collection`] when it returns `true`.
    pub fn need_garbage_collection(&self) -> bool {
        self.epoch.need_garbage_collection()
    }

    /// Advances the global epoch and sweeps every registered thread's
    /// garbage list.
    pub fn perform_garbage_collection(&self) {
        self.epoch.perform_garbage_collection();
    }

    // -- internal: single-attempt operations, retried by the public API --

    fn try_insert(&self, key: &K, value: &V, token: &EpochToken) -> Retry<bool> {
        let (parent_id, leaf_id) = self.find_leaf(key, token)?;
        let ptr = self.mapping_table.get(leaf_id);
        let chain = unsafe { &*ptr }.as_leaf().expect("find_leaf must resolve to a leaf");
        if chain.contains(key, value, &self.mapping_table) {
            return Ok(false);
        }
        self.post_leaf_insert(leaf_id, ptr, key.clone(), value.clone())?;
        self.maintain_leaf(parent_id, leaf_id, token);
        Ok(true)
    }

    fn try_conditional_insert(
        &self,
        key: &K,
        value: &V,
        predicate: &impl Fn(&V) -> bool,
        token: &EpochToken,
    ) -> Retry<(bool, bool)> {
        let (parent_id, leaf_id) = self.find_leaf(key, token)?;
        let ptr = self.mapping_table.get(leaf_id);
        let chain = unsafe { &*ptr }.as_leaf().expect("find_leaf must resolve to a leaf");
        let existing = chain.get_values(key, &self.mapping_table);
        if existing.iter().any(|v| predicate(v)) {
            return Ok((false, true));
        }
        if existing.contains(value) {
            return Ok((false, false));
        }
        self.post_leaf_insert(leaf_id, ptr, key.clone(), value.clone())?;
        self.maintain_leaf(parent_id, leaf_id, token);
        Ok((true, false))
    }

    fn try_delete(&self, key: &K, value: &V, token: &EpochToken) -> Retry<bool> {
        let (parent_id, leaf_id) = self.find_leaf(key, token)?;
        let ptr = self.mapping_table.get(leaf_id);
        let chain = unsafe { &*ptr }.as_leaf().expect("find_leaf must resolve to a leaf");
        if !chain.contains(key, value, &self.mapping_table) {
            return Ok(false);
        }
        self.post_leaf_delete(leaf_id, ptr, key.clone(), value.clone())?;
        self.maintain_leaf(parent_id, leaf_id, token);
        Ok(true)
    }

    fn try_get_value(&self, key: &K, token: &EpochToken) -> Retry<Vec<V>> {
        let (_, leaf_id) = self.find_leaf(key, token)?;
        let ptr = self.mapping_table.get(leaf_id);
        let chain = unsafe { &*ptr }.as_leaf().expect("find_leaf must resolve to a leaf");
        Ok(chain.get_values(key, &self.mapping_table))
    }

    // -- traversal --

    /// Descends from the root to the leaf that would hold `key`,
    /// performing sibling-chain repair and partial-SMO help-along at
    /// every level. Returns the leaf's immediate parent (always a real
    /// `NodeID`: the root is always an inner node) and the leaf itself.
    fn find_leaf(&self, key: &K, token: &EpochToken) -> Retry<(NodeID, NodeID)> {
        let mut parent_id = INVALID_NODE_ID;
        let mut node_id = self.root_id.load(Ordering::Acquire);
        loop {
            let ptr = self.mapping_table.get(node_id);
            debug_assert!(!ptr.is_null(), "mapping table slot for node {node_id} is unpopulated");
            let page = unsafe { &*ptr };

            // 1. Sibling-chain repair.
            if let Some(high_key) = page.high_key(&self.mapping_table) {
                if key >= high_key {
                    let next = page.next_sibling(&self.mapping_table);
                    if next != INVALID_NODE_ID {
                        node_id = next;
                        continue;
                    }
                }
            }

            // 2. Partial-SMO help-along, then descend or stop.
            match page {
                PageNode::Leaf(chain) => {
                    self.help_along_leaf(node_id, parent_id, chain, token)?;
                    return Ok((parent_id, node_id));
                }
                PageNode::Inner(chain) => {
                    self.help_along_inner(node_id, parent_id, chain, token)?;
                    let ptr = self.mapping_table.get(node_id);
                    let chain = unsafe { &*ptr }
                        .as_inner()
                        .expect("help-along must not change a node's structural family");
                    let child = chain.find_child(key, &self.mapping_table);
                    self.maintain_inner(parent_id, node_id, token);
                    parent_id = node_id;
                    node_id = child;
                }
            }
        }
    }

    fn help_along_leaf(
        &self,
        node_id: NodeID,
        parent_id: NodeID,
        chain: &LeafChain<K, V>,
        _token: &EpochToken,
    ) -> Retry<()> {
        if let Some(_removed) = chain.top_remove() {
            self.complete_merge_leaf(node_id, parent_id, chain)?;
            return Err(StructuralRetry);
        }
        if let Some((split_key, new_sibling)) = chain.top_split() {
            self.post_inner_insert_on_parent(parent_id, split_key.clone(), new_sibling)?;
            return Err(StructuralRetry);
        }
        Ok(())
    }

    fn help_along_inner(
        &self,
        node_id: NodeID,
        parent_id: NodeID,
        chain: &InnerChain<K, V>,
        _token: &EpochToken,
    ) -> Retry<()> {
        if chain.is_abort() {
            // "do not attempt any install here" — reads pass straight
            // through an abort placeholder (find_child already does so);
            // nothing to help along.
            return Ok(());
        }
        if let Some(_removed) = chain.top_remove() {
            self.complete_merge_inner(node_id, parent_id, chain)?;
            return Err(StructuralRetry);
        }
        if let Some((split_key, new_sibling)) = chain.top_split() {
            if node_id == self.root_id.load(Ordering::Acquire) {
                self.complete_root_split(node_id, split_key.clone(), new_sibling);
            } else {
                self.post_inner_insert_on_parent(parent_id, split_key.clone(), new_sibling)?;
            }
            return Err(StructuralRetry);
        }
        Ok(())
    }

    // -- posting deltas --

    fn post_leaf_insert(&self, node_id: NodeID, expected: *mut PageNode<K, V>, key: K, value: V) -> Retry<()> {
        let location_hint = unsafe { &*expected }
            .as_leaf()
            .expect("post_leaf_insert target must be a leaf")
            .item_count(&self.mapping_table);
        let delta = Box::into_raw(Box::new(PageNode::Leaf(LeafChain::Insert(LeafInsertDelta {
            key,
            value,
            location_hint,
            next: expected,
        }))));
        match self.mapping_table.compare_and_swap(node_id, expected, delta) {
            Ok(_) => Ok(()),
            Err(_) => {
                unsafe { drop(Box::from_raw(delta)) };
                Err(StructuralRetry)
            }
        }
    }

    fn post_leaf_delete(&self, node_id: NodeID, expected: *mut PageNode<K, V>, key: K, value: V) -> Retry<()> {
        let delta = Box::into_raw(Box::new(PageNode::Leaf(LeafChain::Delete(LeafDeleteDelta {
            key,
            value,
            next: expected,
        }))));
        match self.mapping_table.compare_and_swap(node_id, expected, delta) {
            Ok(_) => Ok(()),
            Err(_) => {
                unsafe { drop(Box::from_raw(delta)) };
                Err(StructuralRetry)
            }
        }
    }

    /// Posts an `InnerInsert` completing a split's help-along, carrying a
    /// hint pointer that narrows the base-node binary search on replay.
    /// Returns `StructuralRetry` (instead of panicking) when `parent_id`
    /// is unknown: this only happens in the brief window of an
    /// in-progress root split, where a traversal reached this node via a
    /// sibling jump before a fresh root made the real parent visible; the
    /// next traversal attempt will have it.
    fn post_inner_insert_on_parent(&self, parent_id: NodeID, split_key: K, new_sibling: NodeID) -> Retry<()> {
        if parent_id == INVALID_NODE_ID {
            return Err(StructuralRetry);
        }
        let ptr = self.mapping_table.get(parent_id);
        let chain = unsafe { &*ptr }.as_inner().expect("split help-along parent must be inner");
        if chain.is_abort() {
            return Err(StructuralRetry);
        }
        let location_hint = chain.item_count(&self.mapping_table);
        let delta = Box::into_raw(Box::new(PageNode::Inner(InnerChain::Insert(InnerInsertDelta {
            key: split_key,
            child: new_sibling,
            location_hint,
            next: ptr,
        }))));
        match self.mapping_table.compare_and_swap(parent_id, ptr, delta) {
            Ok(_) => {
                tracing::debug!(parent_id, new_sibling, "posted inner insert completing split");
                Ok(())
            }
            Err(_) => {
                unsafe { drop(Box::from_raw(delta)) };
                Err(StructuralRetry)
            }
        }
    }

    fn post_inner_delete_on_parent(&self, parent_id: NodeID, merge_key: K, removed_child: NodeID) -> Retry<()> {
        if parent_id == INVALID_NODE_ID {
            return Err(StructuralRetry);
        }
        let ptr = self.mapping_table.get(parent_id);
        let chain = unsafe { &*ptr }.as_inner().expect("merge help-along parent must be inner");
        if chain.is_abort() {
            return Err(StructuralRetry);
        }
        let (_, _, seps) = flatten_inner(chain, &self.mapping_table);
        let (prev_key, next_key) = SortedSmallSet::from_sorted(seps).bounds(&merge_key);
        let delta = Box::into_raw(Box::new(PageNode::Inner(InnerChain::Delete(InnerDeleteDelta {
            key: merge_key,
            removed_child,
            prev_key,
            next_key,
            next: ptr,
        }))));
        match self.mapping_table.compare_and_swap(parent_id, ptr, delta) {
            Ok(_) => {
                tracing::debug!(parent_id, removed_child, "posted inner delete completing merge");
                Ok(())
            }
            Err(_) => {
                unsafe { drop(Box::from_raw(delta)) };
                Err(StructuralRetry)
            }
        }
    }

    fn complete_root_split(&self, old_root_id: NodeID, split_key: K, new_sibling: NodeID) {
        let old_ptr = self.mapping_table.get(old_root_id);
        let low_key = unsafe { &*old_ptr }.low_key().clone();
        let new_root_id = self.mapping_table.allocate_node_id();
        let base = InnerBase {
            low_key,
            low_child: old_root_id,
            seps: vec![(split_key, new_sibling)],
            high_key: None,
            next_sibling: INVALID_NODE_ID,
        };
        self.mapping_table.install(new_root_id, PageNode::Inner(InnerChain::Base(base)));
        match self
            .root_id
            .compare_exchange(old_root_id, new_root_id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => tracing::debug!(old_root_id, new_root_id, "root split completed"),
            Err(_) => {
                // Someone else completed the root split first. `new_root_id`
                // was never published anywhere another thread could reach
                // it (the only publish step is the CAS we just lost), so
                // it is safe to free directly.
                let ptr = self.mapping_table.get(new_root_id);
                unsafe { drop(Box::from_raw(ptr)) };
                self.mapping_table.recycle_node_id(new_root_id);
            }
        }
    }

    /// Finds the separator in `parent_id`'s delta chain whose key
    /// immediately precedes `removed_low_key`, replaying the chain into
    /// key order via a [`SortedSmallSet`].
    fn find_left_sibling(&self, parent_id: NodeID, removed_low_key: &K) -> NodeID {
        let ptr = self.mapping_table.get(parent_id);
        let chain = unsafe { &*ptr }.as_inner().expect("left-sibling lookup requires an inner parent");
        let (_, low_child, seps) = flatten_inner(chain, &self.mapping_table);
        SortedSmallSet::from_sorted(seps).predecessor(removed_low_key, low_child)
    }

    fn complete_merge_leaf(
        &self,
        node_id: NodeID,
        parent_id: NodeID,
        chain: &LeafChain<K, V>,
    ) -> Retry<()> {
        if parent_id == INVALID_NODE_ID {
            return Err(StructuralRetry);
        }
        let low_key = chain.low_key().clone();
        let left_id = self.find_left_sibling(parent_id, &low_key);
        if left_id == node_id {
            // Shouldn't happen (a node is never merged into itself); bail
            // out and let the next traversal re-observe the state.
            return Err(StructuralRetry);
        }
        let left_ptr = self.mapping_table.get(left_id);
        let merge_delta = Box::into_raw(Box::new(PageNode::Leaf(LeafChain::Merge(LeafMergeDelta {
            merge_key: low_key.clone(),
            deleted_node: node_id,
            right_branch: node_id,
            next: left_ptr,
        }))));
        if self.mapping_table.compare_and_swap(left_id, left_ptr, merge_delta).is_err() {
            unsafe { drop(Box::from_raw(merge_delta)) };
            return Err(StructuralRetry);
        }
        self.post_inner_delete_on_parent(parent_id, low_key, node_id)?;
        // `node_id`'s slot is now unreachable from the tree except through
        // the merge delta's `right_branch`, which the left sibling's chain
        // re-resolves through the mapping table on every read. That means
        // `node_id`'s chain must stay installed, and its id must stay
        // un-recycled, for as long as the merge delta itself is reachable —
        // i.e. until the left sibling is consolidated and the delta
        // (including this `right_branch` reference) is discarded. So this
        // function does *not* hand `node_id` to the epoch manager itself;
        // `maybe_consolidate_leaf`'s garbage submission for the left
        // sibling's old chain is what eventually makes it collectible, and
        // `epoch::EpochManager::free_leaf_chain`'s `Merge` arm is what
        // actually frees `node_id`'s chain and recycles its id, at that
        // later, safe point.
        tracing::debug!(node_id, left_id, "leaf merge completed");
        Ok(())
    }

    fn complete_merge_inner(
        &self,
        node_id: NodeID,
        parent_id: NodeID,
        chain: &InnerChain<K, V>,
    ) -> Retry<()> {
        if parent_id == INVALID_NODE_ID {
            return Err(StructuralRetry);
        }
        let low_key = chain.low_key().clone();
        let left_id = self.find_left_sibling(parent_id, &low_key);
        if left_id == node_id {
            return Err(StructuralRetry);
        }
        let left_ptr = self.mapping_table.get(left_id);
        let merge_delta = Box::into_raw(Box::new(PageNode::Inner(InnerChain::Merge(InnerMergeDelta {
            merge_key: low_key.clone(),
            deleted_node: node_id,
            right_branch: node_id,
            next: left_ptr,
        }))));
        if self.mapping_table.compare_and_swap(left_id, left_ptr, merge_delta).is_err() {
            unsafe { drop(Box::from_raw(merge_delta)) };
            return Err(StructuralRetry);
        }
        self.post_inner_delete_on_parent(parent_id, low_key, node_id)?;
        // See `complete_merge_leaf`: `node_id`'s chain stays live and
        // un-recycled until the left sibling's consolidation discards the
        // merge delta that references it.
        tracing::debug!(node_id, left_id, "inner merge completed");
        Ok(())
    }

    // -- maintenance: consolidation, split, merge initiation --

    fn maintain_leaf(&self, parent_id: NodeID, node_id: NodeID, token: &EpochToken) {
        self.maybe_consolidate_leaf(node_id, token);
        self.maybe_split_leaf(node_id, token);
        self.maybe_merge_leaf(parent_id, node_id, token);
    }

    fn maintain_inner(&self, parent_id: NodeID, node_id: NodeID, token: &EpochToken) {
        self.maybe_consolidate_inner(node_id, token);
        self.maybe_split_inner(node_id, token);
        self.maybe_merge_inner(parent_id, node_id, token);
    }

    fn maybe_consolidate_leaf(&self, node_id: NodeID, token: &EpochToken) {
        let ptr = self.mapping_table.get(node_id);
        let chain = match unsafe { &*ptr }.as_leaf() {
            Some(c) => c,
            None => return,
        };
        if chain.depth(&self.mapping_table) < self.config.consolidate_threshold {
            return;
        }
        let new_base = consolidate_leaf(chain, &self.mapping_table);
        let new_ptr = Box::into_raw(Box::new(PageNode::Leaf(LeafChain::Base(new_base))));
        match self.mapping_table.compare_and_swap(node_id, ptr, new_ptr) {
            Ok(old) => {
                tracing::debug!(node_id, "leaf consolidated");
                self.epoch.add_garbage(token, Garbage::Node(old));
            }
            Err(_) => {
                // The freshly built node is submitted for reclamation
                // rather than retried, even though it was never linked:
                // some other thread already made progress on this node, so
                // this attempt's result is simply stale.
                self.epoch.add_garbage(token, Garbage::Node(new_ptr));
            }
        }
    }

    fn maybe_consolidate_inner(&self, node_id: NodeID, token: &EpochToken) {
        let ptr = self.mapping_table.get(node_id);
        let chain = match unsafe { &*ptr }.as_inner() {
            Some(c) => c,
            None => return,
        };
        if chain.depth(&self.mapping_table) < self.config.consolidate_threshold {
            return;
        }
        let new_base = consolidate_inner(chain, &self.mapping_table);
        let new_ptr = Box::into_raw(Box::new(PageNode::Inner(InnerChain::Base(new_base))));
        match self.mapping_table.compare_and_swap(node_id, ptr, new_ptr) {
            Ok(old) => {
                tracing::debug!(node_id, "inner consolidated");
                self.epoch.add_garbage(token, Garbage::Node(old));
            }
            Err(_) => {
                self.epoch.add_garbage(token, Garbage::Node(new_ptr));
            }
        }
    }

    fn maybe_split_leaf(&self, node_id: NodeID, token: &EpochToken) {
        let ptr = self.mapping_table.get(node_id);
        let chain = match unsafe { &*ptr }.as_leaf() {
            Some(c) => c,
            None => return,
        };
        if chain.item_count(&self.mapping_table) <= self.config.split_threshold {
            return;
        }
        let high_key = chain.high_key(&self.mapping_table).cloned();
        let (_, items) = flatten_leaf(chain, high_key.as_ref(), &self.mapping_table);
        let Some(split_idx) = choose_split_point(&items, self.config.merge_threshold) else {
            return;
        };
        let split_key = items[split_idx].0.clone();
        let right_items = items[split_idx..].to_vec();
        let next_sibling = chain.next_sibling(&self.mapping_table);

        let new_id = self.mapping_table.allocate_node_id();
        let new_base = LeafBase {
            low_key: split_key.clone(),
            items: right_items,
            high_key,
            next_sibling,
        };
        self.mapping_table.install(new_id, PageNode::Leaf(LeafChain::Base(new_base)));

        let split_delta = Box::into_raw(Box::new(PageNode::Leaf(LeafChain::Split(LeafSplitDelta {
            split_key,
            new_sibling: new_id,
            next: ptr,
        }))));
        match self.mapping_table.compare_and_swap(node_id, ptr, split_delta) {
            Ok(_) => tracing::debug!(node_id, new_id, "leaf split"),
            Err(_) => {
                unsafe { drop(Box::from_raw(split_delta)) };
                self.abandon_split_sibling_leaf(new_id, token);
            }
        }
    }

    fn maybe_split_inner(&self, node_id: NodeID, token: &EpochToken) {
        let ptr = self.mapping_table.get(node_id);
        let chain = match unsafe { &*ptr }.as_inner() {
            Some(c) => c,
            None => return,
        };
        if chain.item_count(&self.mapping_table) <= self.config.split_threshold {
            return;
        }
        let high_key = chain.high_key(&self.mapping_table).cloned();
        let next_sibling = chain.next_sibling(&self.mapping_table);
        let (_, _low_child, mut seps) = flatten_inner(chain, &self.mapping_table);
        if let Some(hk) = &high_key {
            seps.retain(|(k, _)| k < hk);
        }
        let mid = seps.len() / 2;
        if mid < self.config.merge_threshold || (seps.len() - mid) < self.config.merge_threshold {
            return;
        }
        let split_key = seps[mid].0.clone();
        let new_low_child = seps[mid].1;
        let right_seps: Vec<_> = seps[mid + 1..].to_vec();

        let new_id = self.mapping_table.allocate_node_id();
        let new_base = InnerBase {
            low_key: split_key.clone(),
            low_child: new_low_child,
            seps: right_seps,
            high_key,
            next_sibling,
        };
        self.mapping_table.install(new_id, PageNode::Inner(InnerChain::Base(new_base)));

        let split_delta = Box::into_raw(Box::new(PageNode::Inner(InnerChain::Split(InnerSplitDelta {
            split_key,
            new_sibling: new_id,
            next: ptr,
        }))));
        match self.mapping_table.compare_and_swap(node_id, ptr, split_delta) {
            Ok(_) => tracing::debug!(node_id, new_id, "inner split"),
            Err(_) => {
                unsafe { drop(Box::from_raw(split_delta)) };
                self.abandon_split_sibling_inner(new_id, token);
            }
        }
    }

    /// Per spec.md §4.1 "Split" step 5: when the split CAS loses the
    /// race, the freshly allocated sibling is never linked from the tree;
    /// wrap it in a synthetic `RemoveNode` so the epoch manager recycles
    /// its `NodeID` once it is safe to do so, then hand that to the
    /// garbage list rather than freeing it outright (a concurrent reader
    /// may already hold the id from a racing `allocate_node_id` caller —
    /// the free list only serves ids out once, but this keeps the
    /// discipline uniform with every other unlink in this module).
    fn abandon_split_sibling_leaf(&self, new_id: NodeID, token: &EpochToken) {
        let new_ptr = self.mapping_table.get(new_id);
        let wrapped = Box::into_raw(Box::new(PageNode::Leaf(LeafChain::Remove(LeafRemoveDelta {
            removed_node: new_id,
            next: new_ptr,
        }))));
        self.epoch.add_garbage(token, Garbage::Node(wrapped));
    }

    fn abandon_split_sibling_inner(&self, new_id: NodeID, token: &EpochToken) {
        let new_ptr = self.mapping_table.get(new_id);
        let wrapped = Box::into_raw(Box::new(PageNode::Inner(InnerChain::Remove(InnerRemoveDelta {
            removed_node: new_id,
            next: new_ptr,
        }))));
        self.epoch.add_garbage(token, Garbage::Node(wrapped));
    }

    fn maybe_merge_leaf(&self, parent_id: NodeID, node_id: NodeID, token: &EpochToken) {
        if parent_id == INVALID_NODE_ID {
            return;
        }
        let ptr = self.mapping_table.get(node_id);
        let chain = match unsafe { &*ptr }.as_leaf() {
            Some(c) => c,
            None => return,
        };
        if chain.top_remove().is_some() || chain.top_split().is_some() {
            return;
        }
        if chain.item_count(&self.mapping_table) >= self.config.merge_threshold {
            return;
        }
        let parent_ptr = self.mapping_table.get(parent_id);
        let parent_chain = match unsafe { &*parent_ptr }.as_inner() {
            Some(c) => c,
            None => return,
        };
        if parent_chain.is_abort() {
            return;
        }
        let (_, low_child, _) = flatten_inner(parent_chain, &self.mapping_table);
        if low_child == node_id {
            // Leftmost child: merging it would change the parent's low key.
            return;
        }

        let abort_delta = Box::into_raw(Box::new(PageNode::Inner(InnerChain::Abort(InnerAbortDelta {
            next: parent_ptr,
        }))));
        if self.mapping_table.compare_and_swap(parent_id, parent_ptr, abort_delta).is_err() {
            unsafe { drop(Box::from_raw(abort_delta)) };
            return;
        }

        let remove_delta = Box::into_raw(Box::new(PageNode::Leaf(LeafChain::Remove(LeafRemoveDelta {
            removed_node: node_id,
            next: ptr,
        }))));
        match self.mapping_table.compare_and_swap(node_id, ptr, remove_delta) {
            Ok(_) => tracing::debug!(node_id, "leaf merge initiated"),
            Err(_) => {
                unsafe { drop(Box::from_raw(remove_delta)) };
                // Undo the parent abort; it *was* published, so a
                // concurrent help-along reader may be mid-dereference of
                // it — route it through the epoch manager rather than
                // freeing it directly.
                if self
                    .mapping_table
                    .compare_and_swap(parent_id, abort_delta, parent_ptr)
                    .is_ok()
                {
                    self.epoch.add_garbage(token, Garbage::Node(abort_delta));
                }
            }
        }
    }

    fn maybe_merge_inner(&self, parent_id: NodeID, node_id: NodeID, token: &EpochToken) {
        if parent_id == INVALID_NODE_ID || node_id == self.root_id.load(Ordering::Acquire) {
            return;
        }
        let ptr = self.mapping_table.get(node_id);
        let chain = match unsafe { &*ptr }.as_inner() {
            Some(c) => c,
            None => return,
        };
        if chain.is_abort() || chain.top_remove().is_some() || chain.top_split().is_some() {
            return;
        }
        if chain.item_count(&self.mapping_table) >= self.config.merge_threshold {
            return;
        }
        let parent_ptr = self.mapping_table.get(parent_id);
        let parent_chain = match unsafe { &*parent_ptr }.as_inner() {
            Some(c) => c,
            None => return,
        };
        if parent_chain.is_abort() {
            return;
        }
        let (_, low_child, _) = flatten_inner(parent_chain, &self.mapping_table);
        if low_child == node_id {
            return;
        }

        let abort_delta = Box::into_raw(Box::new(PageNode::Inner(InnerChain::Abort(InnerAbortDelta {
            next: parent_ptr,
        }))));
        if self.mapping_table.compare_and_swap(parent_id, parent_ptr, abort_delta).is_err() {
            unsafe { drop(Box::from_raw(abort_delta)) };
            return;
        }

        let remove_delta = Box::into_raw(Box::new(PageNode::Inner(InnerChain::Remove(InnerRemoveDelta {
            removed_node: node_id,
            next: ptr,
        }))));
        match self.mapping_table.compare_and_swap(node_id, ptr, remove_delta) {
            Ok(_) => tracing::debug!(node_id, "inner merge initiated"),
            Err(_) => {
                unsafe { drop(Box::from_raw(remove_delta)) };
                if self
                    .mapping_table
                    .compare_and_swap(parent_id, abort_delta, parent_ptr)
                    .is_ok()
                {
                    self.epoch.add_garbage(token, Garbage::Node(abort_delta));
                }
            }
        }
    }
}

impl<K, V> Default for BwTree<K, V>
where
    K: Ord + Clone + Default + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// Every node a `BwTree` ever touches lives behind the mapping table's
// `AtomicPtr`s or the epoch manager's garbage lists; nothing borrows from
// `&self` across an await or escapes a single call, so sharing a tree
// across threads is sound whenever `K`/`V` themselves are.
unsafe impl<K: Send, V: Send> Send for BwTree<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for BwTree<K, V> {}

/// Chooses the index of the first item belonging to the right half of a
/// split, preferring the median but walking to a run boundary if an
/// equal-key run straddles it (spec.md §4.1, "Split" step 1). Returns
/// `None` if no boundary leaves both halves at or above `min_half`.
fn choose_split_point<K: Ord, V>(items: &[(K, V)], min_half: usize) -> Option<usize> {
    let n = items.len();
    if n < 2 * min_half {
        return None;
    }
    let mid = n / 2;
    if items[mid - 1].0 != items[mid].0 {
        return Some(mid);
    }
    let mut left = mid;
    while left > 0 && items[left - 1].0 == items[mid].0 {
        left -= 1;
    }
    if left >= min_half && n - left >= min_half {
        return Some(left);
    }
    let mut right = mid;
    while right < n && items[right].0 == items[mid].0 {
        right += 1;
    }
    if right >= min_half && n - right >= min_half {
        return Some(right);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_value() {
        let tree: BwTree<u64, u64> = BwTree::new();
        assert!(tree.insert(1, 100));
        assert_eq!(tree.get_value(&1), vec![100]);
        assert!(tree.insert(2, 200));
        assert_eq!(tree.get_value(&2), vec![200]);
        assert_eq!(tree.get_value(&3), Vec::<u64>::new());
    }

    #[test]
    fn duplicate_exact_pair_rejected() {
        let tree: BwTree<u64, u64> = BwTree::new();
        assert!(tree.insert(5, 1));
        assert!(!tree.insert(5, 1));
        assert!(tree.insert(5, 2));
        let mut values = tree.get_value(&5);
        values.sort();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn insert_delete_inversion() {
        let tree: BwTree<u64, u64> = BwTree::new();
        assert!(tree.insert(7, 42));
        assert!(tree.delete(7, 42));
        assert_eq!(tree.get_value(&7), Vec::<u64>::new());
        assert!(!tree.delete(7, 42));
    }

    #[test]
    fn conditional_insert_predicate_and_duplicate() {
        let tree: BwTree<u64, u64> = BwTree::new();
        assert_eq!(tree.conditional_insert(42, 7, |v| *v > 5), (false, true));
        assert_eq!(tree.conditional_insert(42, 7, |v| *v < 5), (true, false));
        assert_eq!(tree.conditional_insert(42, 7, |v| *v < 5), (false, false));
    }

    #[test]
    fn split_and_consolidate_across_many_keys() {
        let tree: BwTree<u64, u64> = BwTree::new();
        for k in 0..2000u64 {
            assert!(tree.insert(k, k));
        }
        for k in 0..2000u64 {
            assert_eq!(tree.get_value(&k), vec![k]);
        }
        assert_eq!(tree.get_value(&2000), Vec::<u64>::new());
    }

    #[test]
    fn insert_then_delete_all_converges_to_empty_iterator() {
        let tree: BwTree<u64, u64> = BwTree::new();
        for k in 0..400u64 {
            assert!(tree.insert(k, k));
        }
        for k in 0..400u64 {
            assert!(tree.delete(k, k));
        }
        tree.perform_garbage_collection();
        assert!(tree.begin().next().is_none());
    }

    #[test]
    fn iterator_yields_keys_in_order() {
        let tree: BwTree<u64, u64> = BwTree::new();
        for k in (0..500u64).rev() {
            tree.insert(k, k * 10);
        }
        let collected: Vec<_> = tree.begin().collect();
        assert_eq!(collected.len(), 500);
        for (i, (k, v)) in collected.iter().enumerate() {
            assert_eq!(*k, i as u64);
            assert_eq!(*v, i as u64 * 10);
        }
    }

    #[test]
    fn begin_at_skips_to_key() {
        let tree: BwTree<u64, u64> = BwTree::new();
        for k in 0..300u64 {
            tree.insert(k, k);
        }
        let first = tree.begin_at(&150).next();
        assert_eq!(first, Some((150, 150)));
    }
}
