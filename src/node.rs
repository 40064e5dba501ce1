//! The node family: base inner/leaf nodes and the delta types layered atop
//! them to form a delta chain, plus consolidation, split, and merge.
//!
//! A node's `NodeID` slot in the mapping table always holds a
//! freshly-allocated [`PageNode`]; every delta posted atop it is itself a
//! fresh allocation whose `next` field is a raw pointer to the *previous*
//! allocation at that slot (not an owning `Box`, and not a copy of its
//! content) — posting a delta is therefore O(1), and the whole chain is
//! only ever freed as a unit, by the epoch manager, once consolidation or
//! removal has made it unreachable from the mapping table.
//!
//! A merge delta is the one exception: it references its absorbed
//! sibling by `NodeID` rather than by raw pointer (design notes: "split
//! and merge nodes reference other NodeIDs, not pointers, so ownership
//! remains a tree under the mapping table"), since that sibling's chain
//! is independently owned by its own slot until its own `RemoveNode` is
//! reclaimed.

use std::collections::BTreeMap;

use crate::mapping_table::{MappingTable, NodeID};

/// A raw pointer to the previous allocation in a delta chain. Valid only
/// for as long as the epoch token active when it was read remains held;
/// every function in this module that dereferences one documents that
/// requirement rather than re-stating it at each call.
pub(crate) type Link<K, V> = *mut PageNode<K, V>;

/// A node's structural family, mirroring the two branches of the node-type
/// table: inner nodes hold child `NodeID`s, leaves hold values directly.
pub(crate) enum PageNode<K, V> {
    Inner(InnerChain<K, V>),
    Leaf(LeafChain<K, V>),
}

impl<K, V> PageNode<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    pub(crate) fn low_key(&self) -> &K {
        match self {
            PageNode::Inner(c) => c.low_key(),
            PageNode::Leaf(c) => c.low_key(),
        }
    }

    pub(crate) fn high_key<'a>(&'a self, mt: &'a MappingTable<K, V>) -> Option<&'a K> {
        match self {
            PageNode::Inner(c) => c.high_key(mt),
            PageNode::Leaf(c) => c.high_key(mt),
        }
    }

    pub(crate) fn next_sibling(&self, mt: &MappingTable<K, V>) -> NodeID {
        match self {
            PageNode::Inner(c) => c.next_sibling(mt),
            PageNode::Leaf(c) => c.next_sibling(mt),
        }
    }

    pub(crate) fn depth(&self, mt: &MappingTable<K, V>) -> u32 {
        match self {
            PageNode::Inner(c) => c.depth(mt),
            PageNode::Leaf(c) => c.depth(mt),
        }
    }

    pub(crate) fn item_count(&self, mt: &MappingTable<K, V>) -> usize {
        match self {
            PageNode::Inner(c) => c.item_count(mt),
            PageNode::Leaf(c) => c.item_count(mt),
        }
    }

    pub(crate) fn as_inner(&self) -> Option<&InnerChain<K, V>> {
        match self {
            PageNode::Inner(c) => Some(c),
            PageNode::Leaf(_) => None,
        }
    }

    pub(crate) fn as_leaf(&self) -> Option<&LeafChain<K, V>> {
        match self {
            PageNode::Leaf(c) => Some(c),
            PageNode::Inner(_) => None,
        }
    }
}

/// Safety: callers hold an epoch token active when `link` was read.
unsafe fn deref_inner_link<'a, K, V>(link: Link<K, V>) -> &'a InnerChain<K, V> {
    debug_assert!(!link.is_null());
    match unsafe { &*link } {
        PageNode::Inner(c) => c,
        PageNode::Leaf(_) => panic!("inner delta chain linked to a leaf-typed node"),
    }
}

/// Safety: callers hold an epoch token active when `link` was read.
unsafe fn deref_leaf_link<'a, K, V>(link: Link<K, V>) -> &'a LeafChain<K, V> {
    debug_assert!(!link.is_null());
    match unsafe { &*link } {
        PageNode::Leaf(c) => c,
        PageNode::Inner(_) => panic!("leaf delta chain linked to an inner-typed node"),
    }
}

/// Safety: callers hold an epoch token active when `mt.get(id)` is read.
unsafe fn resolve_inner<'a, K, V>(mt: &'a MappingTable<K, V>, id: NodeID) -> &'a InnerChain<K, V> {
    unsafe { deref_inner_link(mt.get(id)) }
}

/// Safety: callers hold an epoch token active when `mt.get(id)` is read.
unsafe fn resolve_leaf<'a, K, V>(mt: &'a MappingTable<K, V>, id: NodeID) -> &'a LeafChain<K, V> {
    unsafe { deref_leaf_link(mt.get(id)) }
}

// ---------------------------------------------------------------------
// Inner family
// ---------------------------------------------------------------------

pub(crate) struct InnerBase<K> {
    pub low_key: K,
    pub low_child: NodeID,
    /// Ascending `(separator key, child)` pairs; `seps[i]` owns
    /// `[seps[i].0, seps[i+1].0)` (or `[seps[i].0, high_key)` for the last).
    pub seps: Vec<(K, NodeID)>,
    pub high_key: Option<K>,
    pub next_sibling: NodeID,
}

pub(crate) struct InnerInsertDelta<K, V> {
    pub key: K,
    pub child: NodeID,
    /// Narrows the binary-search range on the underlying base node;
    /// purely an optimization hint, never load-bearing for correctness.
    pub location_hint: usize,
    pub next: Link<K, V>,
}

pub(crate) struct InnerDeleteDelta<K, V> {
    pub key: K,
    pub removed_child: NodeID,
    pub prev_key: Option<K>,
    pub next_key: Option<K>,
    pub next: Link<K, V>,
}

pub(crate) struct InnerSplitDelta<K, V> {
    pub split_key: K,
    pub new_sibling: NodeID,
    pub next: Link<K, V>,
}

pub(crate) struct InnerMergeDelta<K, V> {
    pub merge_key: K,
    pub deleted_node: NodeID,
    /// The absorbed sibling's own `NodeID`; its chain is re-fetched
    /// through the mapping table on demand, not owned here.
    pub right_branch: NodeID,
    pub next: Link<K, V>,
}

pub(crate) struct InnerRemoveDelta<K, V> {
    pub removed_node: NodeID,
    pub next: Link<K, V>,
}

pub(crate) struct InnerAbortDelta<K, V> {
    pub next: Link<K, V>,
}

pub(crate) enum InnerChain<K, V> {
    Base(InnerBase<K>),
    Insert(InnerInsertDelta<K, V>),
    Delete(InnerDeleteDelta<K, V>),
    Split(InnerSplitDelta<K, V>),
    Merge(InnerMergeDelta<K, V>),
    Remove(InnerRemoveDelta<K, V>),
    Abort(InnerAbortDelta<K, V>),
}

impl<K: Ord + Clone, V: Clone + PartialEq> InnerChain<K, V> {
    pub(crate) fn low_key(&self) -> &K {
        match self {
            InnerChain::Base(b) => &b.low_key,
            InnerChain::Insert(d) => unsafe { deref_inner_link(d.next) }.low_key(),
            InnerChain::Delete(d) => unsafe { deref_inner_link(d.next) }.low_key(),
            InnerChain::Split(d) => unsafe { deref_inner_link(d.next) }.low_key(),
            InnerChain::Merge(d) => unsafe { deref_inner_link(d.next) }.low_key(),
            InnerChain::Remove(d) => unsafe { deref_inner_link(d.next) }.low_key(),
            InnerChain::Abort(d) => unsafe { deref_inner_link(d.next) }.low_key(),
        }
    }

    pub(crate) fn high_key<'a>(&'a self, mt: &'a MappingTable<K, V>) -> Option<&'a K> {
        match self {
            InnerChain::Base(b) => b.high_key.as_ref(),
            InnerChain::Split(d) => Some(&d.split_key),
            InnerChain::Merge(d) => {
                let right = unsafe { resolve_inner(mt, d.right_branch) };
                right.high_key(mt)
            }
            InnerChain::Insert(d) => unsafe { deref_inner_link(d.next) }.high_key(mt),
            InnerChain::Delete(d) => unsafe { deref_inner_link(d.next) }.high_key(mt),
            InnerChain::Remove(d) => unsafe { deref_inner_link(d.next) }.high_key(mt),
            InnerChain::Abort(d) => unsafe { deref_inner_link(d.next) }.high_key(mt),
        }
    }

    pub(crate) fn next_sibling(&self, mt: &MappingTable<K, V>) -> NodeID {
        match self {
            InnerChain::Base(b) => b.next_sibling,
            InnerChain::Split(d) => d.new_sibling,
            InnerChain::Merge(d) => {
                let right = unsafe { resolve_inner(mt, d.right_branch) };
                right.next_sibling(mt)
            }
            InnerChain::Insert(d) => unsafe { deref_inner_link(d.next) }.next_sibling(mt),
            InnerChain::Delete(d) => unsafe { deref_inner_link(d.next) }.next_sibling(mt),
            InnerChain::Remove(d) => unsafe { deref_inner_link(d.next) }.next_sibling(mt),
            InnerChain::Abort(d) => unsafe { deref_inner_link(d.next) }.next_sibling(mt),
        }
    }

    pub(crate) fn depth(&self, mt: &MappingTable<K, V>) -> u32 {
        match self {
            InnerChain::Base(_) => 0,
            InnerChain::Merge(d) => {
                let right = unsafe { resolve_inner(mt, d.right_branch) };
                unsafe { deref_inner_link(d.next) }.depth(mt) + right.depth(mt)
            }
            InnerChain::Insert(d) => unsafe { deref_inner_link(d.next) }.depth(mt) + 1,
            InnerChain::Delete(d) => unsafe { deref_inner_link(d.next) }.depth(mt) + 1,
            InnerChain::Split(d) => unsafe { deref_inner_link(d.next) }.depth(mt) + 1,
            InnerChain::Remove(d) => unsafe { deref_inner_link(d.next) }.depth(mt) + 1,
            InnerChain::Abort(d) => unsafe { deref_inner_link(d.next) }.depth(mt) + 1,
        }
    }

    pub(crate) fn item_count(&self, mt: &MappingTable<K, V>) -> usize {
        match self {
            InnerChain::Base(b) => b.seps.len(),
            InnerChain::Insert(d) => unsafe { deref_inner_link(d.next) }.item_count(mt) + 1,
            InnerChain::Delete(d) => unsafe { deref_inner_link(d.next) }.item_count(mt).saturating_sub(1),
            InnerChain::Split(d) => unsafe { deref_inner_link(d.next) }.item_count(mt),
            InnerChain::Merge(d) => {
                let right = unsafe { resolve_inner(mt, d.right_branch) };
                unsafe { deref_inner_link(d.next) }.item_count(mt) + right.item_count(mt)
            }
            InnerChain::Remove(d) => unsafe { deref_inner_link(d.next) }.item_count(mt),
            InnerChain::Abort(d) => unsafe { deref_inner_link(d.next) }.item_count(mt),
        }
    }

    pub(crate) fn top_remove(&self) -> Option<NodeID> {
        match self {
            InnerChain::Remove(d) => Some(d.removed_node),
            _ => None,
        }
    }

    pub(crate) fn top_split(&self) -> Option<(&K, NodeID)> {
        match self {
            InnerChain::Split(d) => Some((&d.split_key, d.new_sibling)),
            _ => None,
        }
    }

    pub(crate) fn is_abort(&self) -> bool {
        matches!(self, InnerChain::Abort(_))
    }

    /// Looks up the child `NodeID` that owns `key`, replaying the delta
    /// chain in front of the base node. Deltas are few (the chain is
    /// consolidated once it grows past the configured depth), so a linear
    /// scan over them is cheap; the base itself is binary searched.
    pub(crate) fn find_child(&self, key: &K, mt: &MappingTable<K, V>) -> NodeID {
        let mut overrides: Vec<(&K, Option<NodeID>)> = Vec::new();
        let mut node: &InnerChain<K, V> = self;
        loop {
            match node {
                InnerChain::Base(base) => {
                    let base_child = base.find_child(key);
                    return Self::resolve_override(&overrides, key, base_child);
                }
                InnerChain::Insert(d) => {
                    if !overrides.iter().any(|(k, _)| *k == &d.key) {
                        overrides.push((&d.key, Some(d.child)));
                    }
                    node = unsafe { deref_inner_link(d.next) };
                }
                InnerChain::Delete(d) => {
                    if !overrides.iter().any(|(k, _)| *k == &d.key) {
                        overrides.push((&d.key, None));
                    }
                    node = unsafe { deref_inner_link(d.next) };
                }
                InnerChain::Split(d) => node = unsafe { deref_inner_link(d.next) },
                InnerChain::Merge(d) => {
                    if key >= &d.merge_key {
                        let right = unsafe { resolve_inner(mt, d.right_branch) };
                        return right.find_child(key, mt);
                    }
                    node = unsafe { deref_inner_link(d.next) };
                }
                InnerChain::Remove(d) => node = unsafe { deref_inner_link(d.next) },
                InnerChain::Abort(d) => node = unsafe { deref_inner_link(d.next) },
            }
        }
    }

    fn resolve_override(overrides: &[(&K, Option<NodeID>)], key: &K, base_child: NodeID) -> NodeID {
        // Among overrides whose separator key is <= search key, the one
        // with the greatest key wins (most specific), falling back to the
        // base's answer when no override applies.
        let mut best: Option<(&K, Option<NodeID>)> = None;
        for (k, child) in overrides {
            if *k <= key && (best.is_none() || *k > best.unwrap().0) {
                best = Some((k, *child));
            }
        }
        match best {
            Some((_, Some(child))) => child,
            Some((_, None)) => base_child,
            None => base_child,
        }
    }
}

impl<K: Ord> InnerBase<K> {
    pub(crate) fn find_child(&self, key: &K) -> NodeID {
        match self.seps.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => self.seps[idx].1,
            Err(0) => self.low_child,
            Err(idx) => self.seps[idx - 1].1,
        }
    }
}

/// Replays an inner delta chain into a flat, key-ordered view: its
/// effective low child, low key, and the separators above it (own base
/// entries plus any spliced-in merged branch). Used both by consolidation
/// and by "finding the left sibling".
pub(crate) fn flatten_inner<K: Ord + Clone, V: Clone + PartialEq>(
    chain: &InnerChain<K, V>,
    mt: &MappingTable<K, V>,
) -> (K, NodeID, Vec<(K, NodeID)>) {
    fn collect<K: Ord + Clone, V: Clone + PartialEq>(
        chain: &InnerChain<K, V>,
        map: &mut BTreeMap<K, NodeID>,
        mt: &MappingTable<K, V>,
    ) -> (K, NodeID) {
        match chain {
            InnerChain::Base(b) => {
                for (k, c) in &b.seps {
                    map.insert(k.clone(), *c);
                }
                (b.low_key.clone(), b.low_child)
            }
            InnerChain::Insert(d) => {
                let root = collect(unsafe { deref_inner_link(d.next) }, map, mt);
                map.insert(d.key.clone(), d.child);
                root
            }
            InnerChain::Delete(d) => {
                let root = collect(unsafe { deref_inner_link(d.next) }, map, mt);
                map.remove(&d.key);
                root
            }
            InnerChain::Split(d) => collect(unsafe { deref_inner_link(d.next) }, map, mt),
            InnerChain::Merge(d) => {
                let right = unsafe { resolve_inner(mt, d.right_branch) };
                let (_, right_low_child, right_seps) = flatten_inner(right, mt);
                let root = collect(unsafe { deref_inner_link(d.next) }, map, mt);
                map.insert(d.merge_key.clone(), right_low_child);
                for (k, c) in right_seps {
                    map.insert(k, c);
                }
                root
            }
            InnerChain::Remove(d) => collect(unsafe { deref_inner_link(d.next) }, map, mt),
            InnerChain::Abort(d) => collect(unsafe { deref_inner_link(d.next) }, map, mt),
        }
    }

    let mut map = BTreeMap::new();
    let (low_key, low_child) = collect(chain, &mut map, mt);
    (low_key, low_child, map.into_iter().collect())
}

pub(crate) fn consolidate_inner<K: Ord + Clone, V: Clone + PartialEq>(
    chain: &InnerChain<K, V>,
    mt: &MappingTable<K, V>,
) -> InnerBase<K> {
    let (low_key, low_child, mut seps) = flatten_inner(chain, mt);
    let high_key = chain.high_key(mt).cloned();
    // Separators at or past the chain's effective high key have migrated
    // to a split sibling; flatten_inner has no high-key of its own to
    // filter by (it's also used for un-split reads like the left-sibling
    // lookup), so the truncation happens here instead.
    if let Some(hk) = &high_key {
        seps.retain(|(k, _)| k < hk);
    }
    InnerBase {
        low_key,
        low_child,
        seps,
        high_key,
        next_sibling: chain.next_sibling(mt),
    }
}

// ---------------------------------------------------------------------
// Leaf family
// ---------------------------------------------------------------------

pub(crate) struct LeafBase<K, V> {
    pub low_key: K,
    /// Ascending, duplicate keys permitted (distinct values).
    pub items: Vec<(K, V)>,
    pub high_key: Option<K>,
    pub next_sibling: NodeID,
}

pub(crate) struct LeafInsertDelta<K, V> {
    pub key: K,
    pub value: V,
    pub location_hint: usize,
    pub next: Link<K, V>,
}

pub(crate) struct LeafDeleteDelta<K, V> {
    pub key: K,
    pub value: V,
    pub next: Link<K, V>,
}

pub(crate) struct LeafSplitDelta<K, V> {
    pub split_key: K,
    pub new_sibling: NodeID,
    pub next: Link<K, V>,
}

pub(crate) struct LeafMergeDelta<K, V> {
    pub merge_key: K,
    pub deleted_node: NodeID,
    /// The absorbed sibling leaf's own `NodeID`; not owned here.
    pub right_branch: NodeID,
    pub next: Link<K, V>,
}

pub(crate) struct LeafRemoveDelta<K, V> {
    pub removed_node: NodeID,
    pub next: Link<K, V>,
}

pub(crate) enum LeafChain<K, V> {
    Base(LeafBase<K, V>),
    Insert(LeafInsertDelta<K, V>),
    Delete(LeafDeleteDelta<K, V>),
    Split(LeafSplitDelta<K, V>),
    Merge(LeafMergeDelta<K, V>),
    Remove(LeafRemoveDelta<K, V>),
}

impl<K: Ord + Clone, V: Clone + PartialEq> LeafChain<K, V> {
    pub(crate) fn low_key(&self) -> &K {
        match self {
            LeafChain::Base(b) => &b.low_key,
            LeafChain::Insert(d) => unsafe { deref_leaf_link(d.next) }.low_key(),
            LeafChain::Delete(d) => unsafe { deref_leaf_link(d.next) }.low_key(),
            LeafChain::Split(d) => unsafe { deref_leaf_link(d.next) }.low_key(),
            LeafChain::Merge(d) => unsafe { deref_leaf_link(d.next) }.low_key(),
            LeafChain::Remove(d) => unsafe { deref_leaf_link(d.next) }.low_key(),
        }
    }

    pub(crate) fn high_key<'a>(&'a self, mt: &'a MappingTable<K, V>) -> Option<&'a K> {
        match self {
            LeafChain::Base(b) => b.high_key.as_ref(),
            LeafChain::Split(d) => Some(&d.split_key),
            LeafChain::Merge(d) => {
                let right = unsafe { resolve_leaf(mt, d.right_branch) };
                right.high_key(mt)
            }
            LeafChain::Insert(d) => unsafe { deref_leaf_link(d.next) }.high_key(mt),
            LeafChain::Delete(d) => unsafe { deref_leaf_link(d.next) }.high_key(mt),
            LeafChain::Remove(d) => unsafe { deref_leaf_link(d.next) }.high_key(mt),
        }
    }

    pub(crate) fn next_sibling(&self, mt: &MappingTable<K, V>) -> NodeID {
        match self {
            LeafChain::Base(b) => b.next_sibling,
            LeafChain::Split(d) => d.new_sibling,
            LeafChain::Merge(d) => {
                let right = unsafe { resolve_leaf(mt, d.right_branch) };
                right.next_sibling(mt)
            }
            LeafChain::Insert(d) => unsafe { deref_leaf_link(d.next) }.next_sibling(mt),
            LeafChain::Delete(d) => unsafe { deref_leaf_link(d.next) }.next_sibling(mt),
            LeafChain::Remove(d) => unsafe { deref_leaf_link(d.next) }.next_sibling(mt),
        }
    }

    pub(crate) fn depth(&self, mt: &MappingTable<K, V>) -> u32 {
        match self {
            LeafChain::Base(_) => 0,
            LeafChain::Merge(d) => {
                let right = unsafe { resolve_leaf(mt, d.right_branch) };
                unsafe { deref_leaf_link(d.next) }.depth(mt) + right.depth(mt)
            }
            LeafChain::Insert(d) => unsafe { deref_leaf_link(d.next) }.depth(mt) + 1,
            LeafChain::Delete(d) => unsafe { deref_leaf_link(d.next) }.depth(mt) + 1,
            LeafChain::Split(d) => unsafe { deref_leaf_link(d.next) }.depth(mt) + 1,
            LeafChain::Remove(d) => unsafe { deref_leaf_link(d.next) }.depth(mt) + 1,
        }
    }

    pub(crate) fn item_count(&self, mt: &MappingTable<K, V>) -> usize {
        match self {
            LeafChain::Base(b) => b.items.len(),
            LeafChain::Insert(d) => unsafe { deref_leaf_link(d.next) }.item_count(mt) + 1,
            LeafChain::Delete(d) => unsafe { deref_leaf_link(d.next) }.item_count(mt).saturating_sub(1),
            LeafChain::Split(d) => unsafe { deref_leaf_link(d.next) }.item_count(mt),
            LeafChain::Merge(d) => {
                let right = unsafe { resolve_leaf(mt, d.right_branch) };
                unsafe { deref_leaf_link(d.next) }.item_count(mt) + right.item_count(mt)
            }
            LeafChain::Remove(d) => unsafe { deref_leaf_link(d.next) }.item_count(mt),
        }
    }

    pub(crate) fn top_remove(&self) -> Option<NodeID> {
        match self {
            LeafChain::Remove(d) => Some(d.removed_node),
            _ => None,
        }
    }

    pub(crate) fn top_split(&self) -> Option<(&K, NodeID)> {
        match self {
            LeafChain::Split(d) => Some((&d.split_key, d.new_sibling)),
            _ => None,
        }
    }

    /// Collects every live value for `key`, shadowing newest-to-oldest so a
    /// delete hides an older insert of the same `(key, value)` pair.
    pub(crate) fn get_values(&self, key: &K, mt: &MappingTable<K, V>) -> Vec<V> {
        let mut shadowed: Vec<(K, V, bool)> = Vec::new(); // (key, value, is_delete)
        let mut node: &LeafChain<K, V> = self;
        loop {
            match node {
                LeafChain::Base(base) => {
                    let mut out: Vec<V> = Vec::new();
                    for (k, v) in &base.items {
                        if k == key && !shadowed.iter().any(|(sk, sv, _)| sk == k && sv == v) {
                            out.push(v.clone());
                        }
                    }
                    for (sk, sv, is_delete) in &shadowed {
                        if sk == key && !is_delete && !out.contains(sv) {
                            out.push(sv.clone());
                        }
                    }
                    return out;
                }
                LeafChain::Insert(d) => {
                    if d.key == *key {
                        shadowed.push((d.key.clone(), d.value.clone(), false));
                    }
                    node = unsafe { deref_leaf_link(d.next) };
                }
                LeafChain::Delete(d) => {
                    if d.key == *key {
                        shadowed.push((d.key.clone(), d.value.clone(), true));
                    }
                    node = unsafe { deref_leaf_link(d.next) };
                }
                LeafChain::Split(d) => node = unsafe { deref_leaf_link(d.next) },
                LeafChain::Merge(d) => {
                    if key >= &d.merge_key {
                        let right = unsafe { resolve_leaf(mt, d.right_branch) };
                        let mut out = right.get_values(key, mt);
                        for (sk, sv, is_delete) in &shadowed {
                            if sk == key && !is_delete && !out.contains(sv) {
                                out.push(sv.clone());
                            } else if sk == key && *is_delete {
                                out.retain(|v| v != sv);
                            }
                        }
                        return out;
                    }
                    node = unsafe { deref_leaf_link(d.next) };
                }
                LeafChain::Remove(d) => node = unsafe { deref_leaf_link(d.next) },
            }
        }
    }

    /// True iff `(key, value)` is currently present.
    pub(crate) fn contains(&self, key: &K, value: &V, mt: &MappingTable<K, V>) -> bool {
        let mut node: &LeafChain<K, V> = self;
        loop {
            match node {
                LeafChain::Base(base) => {
                    return base.items.iter().any(|(k, v)| k == key && v == value);
                }
                LeafChain::Insert(d) => {
                    if d.key == *key && d.value == *value {
                        return true;
                    }
                    node = unsafe { deref_leaf_link(d.next) };
                }
                LeafChain::Delete(d) => {
                    if d.key == *key && d.value == *value {
                        return false;
                    }
                    node = unsafe { deref_leaf_link(d.next) };
                }
                LeafChain::Split(d) => node = unsafe { deref_leaf_link(d.next) },
                LeafChain::Merge(d) => {
                    if key >= &d.merge_key {
                        let right = unsafe { resolve_leaf(mt, d.right_branch) };
                        return right.contains(key, value, mt);
                    }
                    node = unsafe { deref_leaf_link(d.next) };
                }
                LeafChain::Remove(d) => node = unsafe { deref_leaf_link(d.next) },
            }
        }
    }
}

/// Flattens a leaf delta chain into ordered `(key, value)` pairs and the
/// chain's effective low key, dropping entries hidden by deletes and
/// entries that have migrated past `high_key` (to the split sibling).
pub(crate) fn flatten_leaf<K: Ord + Clone, V: Clone + PartialEq>(
    chain: &LeafChain<K, V>,
    high_key: Option<&K>,
    mt: &MappingTable<K, V>,
) -> (K, Vec<(K, V)>) {
    enum Op<K, V> {
        Insert(K, V),
        Delete(K, V),
    }

    fn collect<K: Ord + Clone, V: Clone + PartialEq>(
        chain: &LeafChain<K, V>,
        ops: &mut Vec<Op<K, V>>,
        mt: &MappingTable<K, V>,
    ) -> (K, Vec<(K, V)>) {
        match chain {
            LeafChain::Base(b) => (b.low_key.clone(), b.items.clone()),
            LeafChain::Insert(d) => {
                let base = collect(unsafe { deref_leaf_link(d.next) }, ops, mt);
                ops.push(Op::Insert(d.key.clone(), d.value.clone()));
                base
            }
            LeafChain::Delete(d) => {
                let base = collect(unsafe { deref_leaf_link(d.next) }, ops, mt);
                ops.push(Op::Delete(d.key.clone(), d.value.clone()));
                base
            }
            LeafChain::Split(d) => collect(unsafe { deref_leaf_link(d.next) }, ops, mt),
            LeafChain::Merge(d) => {
                let right = unsafe { resolve_leaf(mt, d.right_branch) };
                let (_, right_items) = flatten_leaf(right, None, mt);
                let base = collect(unsafe { deref_leaf_link(d.next) }, ops, mt);
                for (k, v) in right_items {
                    ops.push(Op::Insert(k, v));
                }
                base
            }
            LeafChain::Remove(d) => collect(unsafe { deref_leaf_link(d.next) }, ops, mt),
        }
    }

    // `collect` recurses to `next` (older) before pushing its own op, so
    // `ops` already comes out oldest-to-newest — replay it in that order
    // directly.
    let mut ops: Vec<Op<K, V>> = Vec::new();
    let (low_key, mut items) = collect(chain, &mut ops, mt);
    for op in ops.into_iter() {
        match op {
            Op::Insert(k, v) => {
                if !items.iter().any(|(ik, iv)| ik == &k && iv == &v) {
                    items.push((k, v));
                }
            }
            Op::Delete(k, v) => {
                items.retain(|(ik, iv)| !(ik == &k && iv == &v));
            }
        }
    }
    if let Some(hk) = high_key {
        items.retain(|(k, _)| k < hk);
    }
    items.sort_by(|a, b| a.0.cmp(&b.0));
    (low_key, items)
}

pub(crate) fn consolidate_leaf<K: Ord + Clone, V: Clone + PartialEq>(
    chain: &LeafChain<K, V>,
    mt: &MappingTable<K, V>,
) -> LeafBase<K, V> {
    let high_key = chain.high_key(mt).cloned();
    let (low_key, items) = flatten_leaf(chain, high_key.as_ref(), mt);
    LeafBase {
        low_key,
        items,
        high_key,
        next_sibling: chain.next_sibling(mt),
    }
}
