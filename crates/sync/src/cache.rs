use std::collections::BTreeMap;
use std::sync::RwLock;

use ledgerd_primitives::Block;

/// A received block waiting for its predecessors to commit.
#[derive(Clone, Debug)]
pub struct CachedBlock {
    pub from_peer: u64,
    pub block: Block,
}

/// Out-of-order block arrivals keyed by height.
#[derive(Default)]
pub struct BlockCache {
    entries: RwLock<BTreeMap<u32, CachedBlock>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `block` under its height. When `capacity` entries are held, a lower height displaces
    /// the highest cached one; anything else is refused.
    pub fn add(&self, from_peer: u64, block: Block, capacity: usize) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        let height = block.height();
        if !entries.contains_key(&height) && entries.len() >= capacity {
            let Some(highest) = entries.keys().next_back().copied() else {
                return false;
            };
            if height >= highest {
                return false;
            }
            entries.remove(&highest);
        }
        entries.insert(height, CachedBlock { from_peer, block });
        true
    }

    pub fn pop(&self, height: u32) -> Option<CachedBlock> {
        self.entries.write().ok()?.remove(&height)
    }

    /// Removes and yields `from`, `from + 1`, ... until the first missing height. Entries are
    /// taken one at a time, so dropping the iterator early leaves the rest cached.
    pub fn pop_contiguous(&self, from: u32) -> PopContiguous<'_> {
        PopContiguous {
            cache: self,
            next: Some(from),
        }
    }

    /// Drops every entry at or below `height`. Returns how many were removed.
    pub fn purge(&self, height: u32) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let Some(above) = height.checked_add(1) else {
            let removed = entries.len();
            entries.clear();
            return removed;
        };
        let kept = entries.split_off(&above);
        let removed = entries.len();
        *entries = kept;
        removed
    }

    pub fn contains(&self, height: u32) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(&height))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn heights(&self) -> Vec<u32> {
        self.entries
            .read()
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default()
    }
}

pub struct PopContiguous<'a> {
    cache: &'a BlockCache,
    next: Option<u32>,
}

impl Iterator for PopContiguous<'_> {
    type Item = CachedBlock;

    fn next(&mut self) -> Option<CachedBlock> {
        let height = self.next?;
        match self.cache.pop(height) {
            Some(entry) => {
                self.next = height.checked_add(1);
                Some(entry)
            }
            None => {
                self.next = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_chainstate::regtest::regtest_chain;

    #[test]
    fn drains_prefix_and_stops_at_gap() {
        let chain = regtest_chain(10);
        let cache = BlockCache::new();
        for height in [4u32, 2, 3, 6, 1] {
            assert!(cache.add(1, chain[height as usize].clone(), 500));
        }
        let drained: Vec<u32> = cache.pop_contiguous(1).map(|e| e.block.height()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert_eq!(cache.heights(), vec![6]);
        assert_eq!(cache.pop_contiguous(5).count(), 0);
    }

    #[test]
    fn early_stop_leaves_rest_cached() {
        let chain = regtest_chain(5);
        let cache = BlockCache::new();
        for block in &chain[1..=5] {
            cache.add(2, block.clone(), 500);
        }
        let mut drain = cache.pop_contiguous(1);
        assert_eq!(drain.next().map(|e| e.block.height()), Some(1));
        drop(drain);
        assert_eq!(cache.heights(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn purge_drops_committed_heights() {
        let chain = regtest_chain(6);
        let cache = BlockCache::new();
        for block in &chain[1..=6] {
            cache.add(1, block.clone(), 500);
        }
        assert_eq!(cache.purge(3), 3);
        assert_eq!(cache.heights(), vec![4, 5, 6]);
        assert_eq!(cache.purge(u32::MAX), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_prefers_lower_heights() {
        let chain = regtest_chain(6);
        let cache = BlockCache::new();
        assert!(cache.add(1, chain[3].clone(), 2));
        assert!(cache.add(1, chain[5].clone(), 2));
        assert!(!cache.add(1, chain[6].clone(), 2));
        assert!(cache.add(1, chain[2].clone(), 2));
        assert_eq!(cache.heights(), vec![2, 3]);
        assert!(cache.add(7, chain[3].clone(), 2));
        assert_eq!(cache.pop(3).map(|e| e.from_peer), Some(7));
        assert_eq!(cache.len(), 1);
    }
}
