//! Tuning parameters for the index, the epoch manager, and the tile-group
//! header. Defaults mirror the table in the design's "External Interfaces"
//! section; every field is overridable at construction.

/// Default size of the [`crate::mapping_table::MappingTable`]: 2^20 slots.
pub const DEFAULT_MAPPING_TABLE_SIZE: usize = 1 << 20;

/// Delta-chain depth at which a node is eligible for consolidation.
pub const DEFAULT_CONSOLIDATE_THRESHOLD: u32 = 8;

/// Item count above which a node is eligible for a split.
pub const DEFAULT_SPLIT_THRESHOLD: usize = 128;

/// Item count below which a node is eligible for a merge.
pub const DEFAULT_MERGE_THRESHOLD: usize = 32;

/// Soft per-thread garbage-list length that triggers reclamation.
pub const DEFAULT_GC_TRIGGER: usize = 1024;

/// Sentinel upper bound on concurrently registered epoch-manager threads.
pub const MAX_THREAD_COUNT_SENTINEL: usize = (1 << 31) - 1;

/// A practical cap on concurrently registered threads per epoch manager
/// instance. `MAX_THREAD_COUNT_SENTINEL` is the value the design names as
/// the theoretical ceiling; no real process runs that many threads, so the
/// epoch manager preallocates a much smaller slot table and asserts if it
/// is ever exhausted (a configuration error, per §7's "programmer error"
/// treatment of invariant violations).
pub const DEFAULT_MAX_REGISTERED_THREADS: usize = 256;

/// Construction-time tuning knobs for a [`crate::BwTree`].
#[derive(Debug, Clone)]
pub struct BwTreeConfig {
    pub mapping_table_size: usize,
    pub consolidate_threshold: u32,
    pub split_threshold: usize,
    pub merge_threshold: usize,
    pub gc_trigger: usize,
    pub max_registered_threads: usize,
    /// If `false`, the host must call [`crate::BwTree::perform_garbage_collection`]
    /// periodically; if `true`, the tree itself advances the epoch and
    /// sweeps garbage synchronously from within mutating calls whenever a
    /// thread's list crosses `gc_trigger`.
    pub start_gc: bool,
}

impl Default for BwTreeConfig {
    fn default() -> Self {
        BwTreeConfig {
            mapping_table_size: DEFAULT_MAPPING_TABLE_SIZE,
            consolidate_threshold: DEFAULT_CONSOLIDATE_THRESHOLD,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            gc_trigger: DEFAULT_GC_TRIGGER,
            max_registered_threads: DEFAULT_MAX_REGISTERED_THREADS,
            start_gc: true,
        }
    }
}

impl BwTreeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mapping_table_size(mut self, size: usize) -> Self {
        self.mapping_table_size = size;
        self
    }

    pub fn with_consolidate_threshold(mut self, depth: u32) -> Self {
        self.consolidate_threshold = depth;
        self
    }

    pub fn with_split_threshold(mut self, items: usize) -> Self {
        self.split_threshold = items;
        self
    }

    pub fn with_merge_threshold(mut self, items: usize) -> Self {
        self.merge_threshold = items;
        self
    }

    pub fn with_gc_trigger(mut self, count: usize) -> Self {
        self.gc_trigger = count;
        self
    }

    pub fn with_start_gc(mut self, start_gc: bool) -> Self {
        self.start_gc = start_gc;
        self
    }
}
