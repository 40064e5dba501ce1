//! A small sorted associative container over `(key, NodeID)` pairs.
//!
//! Grounded in `original_source/src/include/index/sorted_small_set.h`:
//! finding a node's left sibling replays its parent's delta chain into key
//! order and then answers a predecessor query against it. The parent
//! fan-out is small (bounded by the split/merge thresholds), so a `Vec`
//! kept in sorted order by insertion beats a balanced tree here, exactly
//! as the original's linear-scan-on-small-N rationale argues.

use crate::mapping_table::NodeID;

pub(crate) struct SortedSmallSet<K> {
    entries: Vec<(K, NodeID)>,
}

impl<K: Ord + Clone> SortedSmallSet<K> {
    /// Builds a set from entries already in ascending key order, as
    /// produced by `node::flatten_inner`.
    pub(crate) fn from_sorted(entries: Vec<(K, NodeID)>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        SortedSmallSet { entries }
    }

    /// The child owning the greatest key strictly less than `key`, or
    /// `default` (the parent's low-child) if no entry qualifies.
    pub(crate) fn predecessor(&self, key: &K, default: NodeID) -> NodeID {
        match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) | Err(idx) => {
                if idx == 0 {
                    default
                } else {
                    self.entries[idx - 1].1
                }
            }
        }
    }

    /// The separator keys immediately below and at-or-above `key`, used to
    /// bound an `InnerDelete`'s effective range during replay.
    pub(crate) fn bounds(&self, key: &K) -> (Option<K>, Option<K>) {
        let idx = match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => idx,
            Err(idx) => idx,
        };
        let prev = if idx == 0 { None } else { Some(self.entries[idx - 1].0.clone()) };
        let next = if idx < self.entries.len() {
            Some(self.entries[idx].0.clone())
        } else {
            None
        };
        (prev, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predecessor_falls_back_to_low_child() {
        let set = SortedSmallSet::from_sorted(vec![(10u32, 2u64), (20, 3), (30, 4)]);
        assert_eq!(set.predecessor(&5, 1), 1);
        assert_eq!(set.predecessor(&10, 1), 1);
        assert_eq!(set.predecessor(&15, 1), 2);
        assert_eq!(set.predecessor(&30, 1), 3);
        assert_eq!(set.predecessor(&31, 1), 4);
    }

    #[test]
    fn bounds_straddle_the_query_key() {
        let set = SortedSmallSet::from_sorted(vec![(10u32, 2u64), (20, 3), (30, 4)]);
        assert_eq!(set.bounds(&15), (Some(10), Some(20)));
        assert_eq!(set.bounds(&10), (None, Some(10)));
        assert_eq!(set.bounds(&30), (Some(20), Some(30)));
        assert_eq!(set.bounds(&100), (Some(30), None));
    }
}
