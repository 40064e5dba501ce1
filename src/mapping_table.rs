//! The mapping table: a dense array from logical [`NodeID`] to the current
//! head pointer of that node's delta chain. All structural updates are
//! performed by compare-and-swap on a table slot; the table never holds a
//! lock.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam_queue::SegQueue;

use crate::node::PageNode;

/// A monotonically allocated node identifier; `0` is reserved as
/// [`INVALID_NODE_ID`].
pub type NodeID = u64;

pub const INVALID_NODE_ID: NodeID = 0;

/// Root and first-leaf ids are fixed at construction time, mirroring the
/// teacher's two-node bootstrap tree.
pub const ROOT_NODE_ID: NodeID = 1;
pub const FIRST_LEAF_NODE_ID: NodeID = 2;

pub(crate) struct MappingTable<K, V> {
    entries: Vec<AtomicPtr<PageNode<K, V>>>,
    next_unused_id: AtomicU64,
    /// NodeIDs returned by the epoch manager once their RemoveNode has been
    /// reclaimed; recycled before the monotonic counter is consulted.
    free_list: SegQueue<NodeID>,
}

impl<K, V> MappingTable<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, AtomicPtr::default);
        MappingTable {
            entries,
            // 0 is INVALID, 1 is the root, 2 is the first leaf.
            next_unused_id: AtomicU64::new(FIRST_LEAF_NODE_ID + 1),
            free_list: SegQueue::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Allocates a fresh `NodeID`, preferring one recycled by the epoch
    /// manager over growing the monotonic counter.
    pub(crate) fn allocate_node_id(&self) -> NodeID {
        if let Some(id) = self.free_list.pop() {
            return id;
        }
        let id = self.next_unused_id.fetch_add(1, Ordering::SeqCst);
        assert!(
            (id as usize) < self.entries.len(),
            "mapping table exhausted: increase BwTreeConfig::mapping_table_size"
        );
        id
    }

    /// Returns a `NodeID` to the free list. Must only be called from
    /// inside epoch reclamation of the `RemoveNode` that carried it
    /// (testable property 7): any thread that read the id earlier has by
    /// then left its epoch.
    pub(crate) fn recycle_node_id(&self, id: NodeID) {
        self.free_list.push(id);
    }

    pub(crate) fn get(&self, id: NodeID) -> *mut PageNode<K, V> {
        debug_assert_ne!(id, INVALID_NODE_ID);
        debug_assert!((id as usize) < self.entries.len());
        self.entries[id as usize].load(Ordering::Acquire)
    }

    /// Unconditionally installs `node` at `id`, used only during tree
    /// bootstrap before any other thread can observe the slot.
    pub(crate) fn install(&self, id: NodeID, node: PageNode<K, V>) {
        let ptr = Box::into_raw(Box::new(node));
        self.entries[id as usize].store(ptr, Ordering::Release);
    }

    /// Atomically replaces the chain head at `id`, linearizing the
    /// operation that installed it. Returns the previous head on success so
    /// the caller can hand it to the epoch manager for reclamation.
    pub(crate) fn compare_and_swap(
        &self,
        id: NodeID,
        expected: *mut PageNode<K, V>,
        new: *mut PageNode<K, V>,
    ) -> Result<*mut PageNode<K, V>, *mut PageNode<K, V>> {
        self.entries[id as usize]
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
    }
}
