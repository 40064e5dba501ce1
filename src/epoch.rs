//! Coarse-grained quiescent-state memory reclamation. Threads join the
//! current global epoch before touching the index and leave when done;
//! nodes unlinked from the tree are deferred on the unlinking thread's
//! garbage list, tagged with the epoch of unlinking, and freed only once
//! no thread could still hold a reference from that epoch or earlier.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;

use crate::mapping_table::{MappingTable, NodeID};
use crate::node::{InnerChain, LeafChain, Link, PageNode};

/// Sentinel last-active-epoch value meaning "this slot's thread is
/// quiescent" — effectively +∞, so it never constrains `min_epoch`.
const QUIESCENT: u64 = u64::MAX;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of deferred work unlinked from the tree and awaiting safe
/// reclamation.
pub(crate) enum Garbage<K, V> {
    Node(*mut PageNode<K, V>),
}

// Garbage only ever travels from the unlinking thread to whichever thread
// later drains the list; by the time it is freed, `min_epoch` has already
// certified no other thread can hold the pointer.
unsafe impl<K, V> Send for Garbage<K, V> {}

struct GarbageItem<K, V> {
    epoch: u64,
    item: Garbage<K, V>,
}

struct ThreadSlot<K, V> {
    last_active_epoch: AtomicU64,
    in_use: AtomicBool,
    garbage: Mutex<Vec<GarbageItem<K, V>>>,
}

impl<K, V> ThreadSlot<K, V> {
    fn new() -> Self {
        ThreadSlot {
            last_active_epoch: AtomicU64::new(QUIESCENT),
            in_use: AtomicBool::new(false),
            garbage: Mutex::new(Vec::new()),
        }
    }
}

thread_local! {
    /// Caches the slot a given epoch manager assigned to this OS thread,
    /// keyed by the manager's `manager_id` (a process may host more than
    /// one `BwTree`, each with its own manager and its own slot numbering).
    static ASSIGNED_SLOTS: Cell<Vec<(u64, usize)>> = Cell::new(Vec::new());
}

/// A thread's membership handle, returned by [`EpochManager::join_epoch`]
/// and consumed by [`EpochManager::leave_epoch`]. Holding one is the only
/// thing that lets a thread safely dereference nodes read from the
/// mapping table.
pub(crate) struct EpochToken {
    slot: usize,
}

pub(crate) struct EpochManager<K, V> {
    manager_id: u64,
    global_epoch: AtomicU64,
    slots: Vec<CachePadded<ThreadSlot<K, V>>>,
    next_free_slot: AtomicUsize,
    gc_trigger: usize,
    /// When `true`, a mutating call that pushes a thread's garbage list
    /// past `gc_trigger` reclaims on the spot. When `false`, the host owns
    /// reclamation timing entirely and must call
    /// `BwTree::perform_garbage_collection` itself.
    auto_reclaim: bool,
    mapping_table: Arc<MappingTable<K, V>>,
}

impl<K, V> EpochManager<K, V> {
    pub(crate) fn new(
        max_threads: usize,
        gc_trigger: usize,
        auto_reclaim: bool,
        mapping_table: Arc<MappingTable<K, V>>,
    ) -> Arc<Self> {
        let mut slots = Vec::with_capacity(max_threads);
        slots.resize_with(max_threads, || CachePadded::new(ThreadSlot::new()));
        Arc::new(EpochManager {
            manager_id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            global_epoch: AtomicU64::new(0),
            slots,
            next_free_slot: AtomicUsize::new(0),
            gc_trigger,
            auto_reclaim,
            mapping_table,
        })
    }

    fn assigned_slot(&self) -> Option<usize> {
        ASSIGNED_SLOTS.with(|cell| {
            let v = cell.take();
            let found = v.iter().find(|(id, _)| *id == self.manager_id).map(|(_, s)| *s);
            cell.set(v);
            found
        })
    }

    fn cache_slot(&self, slot: usize) {
        ASSIGNED_SLOTS.with(|cell| {
            let mut v = cell.take();
            v.push((self.manager_id, slot));
            cell.set(v);
        });
    }

    /// Records that the calling thread is active as of the current global
    /// epoch. Refreshing an already-joined thread is explicitly allowed
    /// (it can only move the minimum forward).
    pub(crate) fn join_epoch(&self) -> EpochToken {
        let slot_idx = match self.assigned_slot() {
            Some(s) => s,
            None => {
                let s = self.next_free_slot.fetch_add(1, Ordering::SeqCst);
                assert!(s < self.slots.len(), "epoch manager: exceeded max_registered_threads");
                self.slots[s].in_use.store(true, Ordering::Relaxed);
                self.cache_slot(s);
                s
            }
        };
        let epoch = self.global_epoch.load(Ordering::Acquire);
        self.slots[slot_idx].last_active_epoch.store(epoch, Ordering::Release);
        tracing::trace!(slot = slot_idx, epoch, "join_epoch");
        EpochToken { slot: slot_idx }
    }

    /// Marks the thread behind `token` quiescent.
    pub(crate) fn leave_epoch(&self, token: EpochToken) {
        tracing::trace!(slot = token.slot, "leave_epoch");
        self.slots[token.slot].last_active_epoch.store(QUIESCENT, Ordering::Release);
    }

    /// Bumps the global epoch. Expected to be called periodically by a
    /// background advancer or by `perform_garbage_collection`.
    pub(crate) fn advance(&self) {
        self.global_epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn min_active_epoch(&self) -> u64 {
        self.slots
            .iter()
            .filter(|s| s.in_use.load(Ordering::Relaxed))
            .map(|s| s.last_active_epoch.load(Ordering::Acquire))
            .min()
            .unwrap_or(QUIESCENT)
    }

    /// Enqueues `item` on the calling thread's garbage list, tagged with
    /// the current global epoch. If the list has grown past the soft
    /// threshold, reclamation runs on this thread's own list.
    pub(crate) fn add_garbage(&self, token: &EpochToken, item: Garbage<K, V>) {
        let epoch = self.global_epoch.load(Ordering::Acquire);
        let len = {
            let mut list = self.slots[token.slot].garbage.lock().unwrap();
            list.push(GarbageItem { epoch, item });
            list.len()
        };
        if self.auto_reclaim && len > self.gc_trigger {
            self.reclaim_slot(token.slot);
        }
    }

    pub(crate) fn need_garbage_collection(&self) -> bool {
        self.slots
            .iter()
            .filter(|s| s.in_use.load(Ordering::Relaxed))
            .any(|s| s.garbage.lock().unwrap().len() > self.gc_trigger)
    }

    /// Sweeps every registered thread's garbage list. Intended for hosts
    /// that construct the tree with `start_gc = false` and drive
    /// reclamation themselves.
    pub(crate) fn perform_garbage_collection(&self) {
        self.advance();
        for idx in 0..self.slots.len() {
            if self.slots[idx].in_use.load(Ordering::Relaxed) {
                self.reclaim_slot(idx);
            }
        }
    }

    fn reclaim_slot(&self, idx: usize) {
        let min_epoch = self.min_active_epoch();
        let mut list = self.slots[idx].garbage.lock().unwrap();
        // Epoch tags are non-decreasing in push order (the global epoch
        // only moves forward), so the first tag that fails the check means
        // every later one does too.
        let mut cut = 0;
        for entry in list.iter() {
            if entry.epoch < min_epoch {
                cut += 1;
            } else {
                break;
            }
        }
        let reclaimable: Vec<GarbageItem<K, V>> = list.drain(0..cut).collect();
        drop(list);
        tracing::debug!(slot = idx, count = reclaimable.len(), min_epoch, "reclaim");
        for entry in reclaimable {
            self.free_garbage(entry.item);
        }
    }

    fn free_garbage(&self, item: Garbage<K, V>) {
        match item {
            Garbage::Node(ptr) => {
                // Safety: `min_epoch` certified no thread's last-active
                // epoch is <= the epoch this node was unlinked in, so no
                // live traversal can hold a reference to it.
                let boxed = unsafe { Box::from_raw(ptr) };
                match *boxed {
                    PageNode::Inner(chain) => self.free_inner_chain(chain),
                    PageNode::Leaf(chain) => self.free_leaf_chain(chain),
                }
            }
        }
    }

    /// Destructs an inner delta chain in order. A merge's right-branch side
    /// pointer (`right_branch`) is *not* a link into this same allocation —
    /// it names another mapping-table slot, still installed and
    /// un-recycled, that only this merge delta references. By the time this
    /// chain (the one holding the `Merge` delta) is itself being freed, the
    /// epoch check in `reclaim_slot` has already certified no live
    /// traversal can still be reading through that merge delta — and
    /// therefore none can still be resolving `right_branch` through it
    /// either — so it is safe to free that branch's chain here too, and
    /// only here: this is the one place a node absorbed by a merge ever
    /// gets reclaimed and its `NodeID` recycled.
    fn free_inner_chain(&self, chain: InnerChain<K, V>) {
        match chain {
            InnerChain::Base(_) => {}
            InnerChain::Insert(d) => self.free_inner_link(d.next),
            InnerChain::Delete(d) => self.free_inner_link(d.next),
            InnerChain::Split(d) => self.free_inner_link(d.next),
            InnerChain::Merge(d) => {
                self.free_inner_link(d.next);
                self.free_merged_inner_branch(d.right_branch);
            }
            InnerChain::Remove(d) => {
                self.mapping_table.recycle_node_id(d.removed_node);
                self.free_inner_link(d.next);
            }
            InnerChain::Abort(d) => self.free_inner_link(d.next),
        }
    }

    /// Safety: only called on a link whose owning `Garbage::Node` has
    /// already been certified unreachable by `reclaim_slot`.
    fn free_inner_link(&self, link: Link<K, V>) {
        let boxed = unsafe { Box::from_raw(link) };
        match *boxed {
            PageNode::Inner(c) => self.free_inner_chain(c),
            PageNode::Leaf(_) => unreachable!("inner delta chain linked to a leaf-typed node"),
        }
    }

    /// Frees the chain a merge's `right_branch` still names in the mapping
    /// table, and recycles its `NodeID` (via the `Remove` delta at its
    /// head). Safety: reached only from `free_inner_chain`'s `Merge` arm,
    /// i.e. only once the merge delta naming this id has itself been
    /// certified reclaimable.
    fn free_merged_inner_branch(&self, id: NodeID) {
        let ptr = self.mapping_table.get(id);
        debug_assert!(!ptr.is_null());
        let boxed = unsafe { Box::from_raw(ptr) };
        match *boxed {
            PageNode::Inner(c) => self.free_inner_chain(c),
            PageNode::Leaf(_) => unreachable!("inner merge right_branch must itself be inner-typed"),
        }
    }

    fn free_leaf_chain(&self, chain: LeafChain<K, V>) {
        match chain {
            LeafChain::Base(_) => {}
            LeafChain::Insert(d) => self.free_leaf_link(d.next),
            LeafChain::Delete(d) => self.free_leaf_link(d.next),
            LeafChain::Split(d) => self.free_leaf_link(d.next),
            LeafChain::Merge(d) => {
                self.free_leaf_link(d.next);
                self.free_merged_leaf_branch(d.right_branch);
            }
            LeafChain::Remove(d) => {
                self.mapping_table.recycle_node_id(d.removed_node);
                self.free_leaf_link(d.next);
            }
        }
    }

    fn free_leaf_link(&self, link: Link<K, V>) {
        let boxed = unsafe { Box::from_raw(link) };
        match *boxed {
            PageNode::Leaf(c) => self.free_leaf_chain(c),
            PageNode::Inner(_) => unreachable!("leaf delta chain linked to an inner-typed node"),
        }
    }

    /// Frees the chain a merge's `right_branch` still names in the mapping
    /// table, and recycles its `NodeID`. Safety: reached only from
    /// `free_leaf_chain`'s `Merge` arm, under the same reasoning as
    /// `free_merged_inner_branch`.
    fn free_merged_leaf_branch(&self, id: NodeID) {
        let ptr = self.mapping_table.get(id);
        debug_assert!(!ptr.is_null());
        let boxed = unsafe { Box::from_raw(ptr) };
        match *boxed {
            PageNode::Leaf(c) => self.free_leaf_chain(c),
            PageNode::Inner(_) => unreachable!("leaf merge right_branch must itself be leaf-typed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping_table::MappingTable;

    #[test]
    fn join_leave_refresh_moves_min_epoch() {
        let table: Arc<MappingTable<u64, u64>> = Arc::new(MappingTable::new(16));
        let mgr = EpochManager::new(4, 1024, true, table);
        let t1 = mgr.join_epoch();
        assert_eq!(mgr.min_active_epoch(), 0);
        mgr.advance();
        let t1 = {
            mgr.leave_epoch(t1);
            mgr.join_epoch()
        };
        assert_eq!(mgr.min_active_epoch(), 1);
        mgr.leave_epoch(t1);
        assert_eq!(mgr.min_active_epoch(), QUIESCENT);
    }

    #[test]
    fn garbage_reclaimed_once_quiescent() {
        let table: Arc<MappingTable<u64, u64>> = Arc::new(MappingTable::new(16));
        let mgr = EpochManager::new(4, 1024, true, table);
        let writer = mgr.join_epoch();
        let ptr: *mut PageNode<u64, u64> = Box::into_raw(Box::new(PageNode::Leaf(LeafChain::Base(
            crate::node::LeafBase {
                low_key: 0,
                items: Vec::new(),
                high_key: None,
                next_sibling: 0,
            },
        ))));
        mgr.add_garbage(&writer, Garbage::Node(ptr));
        mgr.leave_epoch(writer);
        mgr.advance();
        mgr.perform_garbage_collection();
    }
}
