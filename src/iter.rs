//! The forward iterator returned by `BwTree::begin`/`BwTree::begin_at`.
//!
//! Each step materializes one leaf's worth of live `(key, value)` pairs by
//! flattening its current delta chain, then walks the leaf's sibling
//! chain when that snapshot is exhausted. A snapshot is a point-in-time
//! read: concurrent writers may add or remove entries in a leaf the
//! iterator has already passed, but never corrupt the walk (leaves are
//! never freed out from under a live epoch token).

use std::sync::Arc;

use crate::epoch::EpochManager;
use crate::mapping_table::{MappingTable, NodeID, INVALID_NODE_ID};
use crate::node::{flatten_leaf, PageNode};

pub struct Iter<K, V> {
    mapping_table: Arc<MappingTable<K, V>>,
    epoch: Arc<EpochManager<K, V>>,
    items: std::vec::IntoIter<(K, V)>,
    next_leaf: NodeID,
}

impl<K, V> Iter<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    pub(crate) fn new(
        mapping_table: Arc<MappingTable<K, V>>,
        epoch: Arc<EpochManager<K, V>>,
        start_leaf: NodeID,
        from_key: Option<&K>,
    ) -> Self {
        let token = epoch.join_epoch();
        let ptr = mapping_table.get(start_leaf);
        let chain = unsafe { &*ptr }.as_leaf().expect("iterator start node must be a leaf");
        let high_key = chain.high_key(&mapping_table).cloned();
        let (_, mut items) = flatten_leaf(chain, high_key.as_ref(), &mapping_table);
        if let Some(k) = from_key {
            items.retain(|(ik, _)| ik >= k);
        }
        let next_leaf = chain.next_sibling(&mapping_table);
        epoch.leave_epoch(token);
        Iter {
            mapping_table,
            epoch,
            items: items.into_iter(),
            next_leaf,
        }
    }

    fn advance_leaf(&mut self) -> bool {
        while self.next_leaf != INVALID_NODE_ID {
            let token = self.epoch.join_epoch();
            let ptr = self.mapping_table.get(self.next_leaf);
            let page: &PageNode<K, V> = unsafe { &*ptr };
            let chain = page.as_leaf().expect("sibling chain must stay within leaf nodes");
            let high_key = chain.high_key(&self.mapping_table).cloned();
            let (_, items) = flatten_leaf(chain, high_key.as_ref(), &self.mapping_table);
            let next = chain.next_sibling(&self.mapping_table);
            self.epoch.leave_epoch(token);
            self.next_leaf = next;
            if !items.is_empty() {
                self.items = items.into_iter();
                return true;
            }
        }
        false
    }
}

impl<K, V> Iterator for Iter<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.items.next() {
                return Some(item);
            }
            if !self.advance_leaf() {
                return None;
            }
        }
    }
}
