//! The transposition node table and the node mutex pool.
//!
//! Every node except the root is owned by exactly one shard of this table.
//! Shards are selected by the low bits of the identity hash. Node memory is
//! allocated with a stable address and freed only by the maintenance sweeps
//! while no search threads are running, which is what makes the borrowed
//! child pointers throughout the tree sound.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::Hash128;

use super::node::SearchNode;

/// An owned node allocation. The wrapper exists so raw node pointers can be
/// stored in the shard maps and shared across threads.
pub struct NodeAlloc(pub *mut SearchNode);

unsafe impl Send for NodeAlloc {}
unsafe impl Sync for NodeAlloc {}

impl NodeAlloc {
    pub fn new(node: SearchNode) -> NodeAlloc {
        NodeAlloc(Box::into_raw(Box::new(node)))
    }

    #[inline]
    pub fn get(&self) -> &SearchNode {
        unsafe { &*self.0 }
    }

    /// Take back ownership to drop the node. Only callable on paths that
    /// have established quiescence.
    pub unsafe fn into_box(self) -> Box<SearchNode> {
        Box::from_raw(self.0)
    }
}

/// Pool of mutexes for node-level coordination (child-slot publication and
/// post-order walk serialization). Sized to a power of two so indices can
/// be drawn by masking.
pub struct MutexPool {
    mutexes: Vec<Mutex<()>>,
}

impl MutexPool {
    pub fn new(size_power_of_two: usize) -> MutexPool {
        let n = 1usize << size_power_of_two;
        MutexPool {
            mutexes: (0..n).map(|_| Mutex::new(())).collect(),
        }
    }

    #[inline]
    pub fn num_mutexes(&self) -> usize {
        self.mutexes.len()
    }

    #[inline]
    pub fn mutex(&self, idx: u32) -> &Mutex<()> {
        &self.mutexes[idx as usize & (self.mutexes.len() - 1)]
    }
}

pub struct NodeTable {
    shards: Vec<Mutex<HashMap<Hash128, NodeAlloc>>>,
}

impl NodeTable {
    pub fn new(shards_power_of_two: usize) -> NodeTable {
        let n = 1usize << shards_power_of_two;
        NodeTable {
            shards: (0..n).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    #[inline]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    pub fn shard_index(&self, hash: Hash128) -> usize {
        (hash.hash0 as usize) & (self.shards.len() - 1)
    }

    #[inline]
    pub fn shard(&self, idx: usize) -> &Mutex<HashMap<Hash128, NodeAlloc>> {
        &self.shards[idx]
    }

    /// Under the shard lock: return the existing node for `hash`, or insert
    /// the one built by `make`. Returns the node and whether it was new.
    pub fn find_or_insert_with(
        &self,
        hash: Hash128,
        make: impl FnOnce() -> SearchNode,
    ) -> (*mut SearchNode, bool) {
        let idx = self.shard_index(hash);
        let mut shard = self.shards[idx].lock();
        match shard.get(&hash) {
            Some(alloc) => (alloc.0, false),
            None => {
                let alloc = NodeAlloc::new(make());
                let ptr = alloc.0;
                shard.insert(hash, alloc);
                (ptr, true)
            }
        }
    }

    /// Total number of nodes currently owned by the table.
    pub fn num_nodes(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Visit every shard map mutably. Used by the multithreaded sweeps,
    /// which partition the shard index range among threads.
    pub fn for_shard_range(
        &self,
        range: std::ops::Range<usize>,
        mut f: impl FnMut(&mut HashMap<Hash128, NodeAlloc>),
    ) {
        for i in range {
            let mut shard = self.shards[i].lock();
            f(&mut shard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Player;

    #[test]
    fn test_find_or_insert() {
        let table = NodeTable::new(4);
        let hash = Hash128::new(0x1234, 0x5678);
        let (p1, new1) = table.find_or_insert_with(hash, || SearchNode::new(Player::Black, false, 0));
        let (p2, new2) = table.find_or_insert_with(hash, || SearchNode::new(Player::White, false, 0));
        assert!(new1);
        assert!(!new2);
        assert_eq!(p1, p2);
        assert_eq!(table.num_nodes(), 1);
        // The original node is returned, not the loser's.
        assert_eq!(unsafe { &*p1 }.next_pla, Player::Black);

        table.for_shard_range(0..table.num_shards(), |shard| {
            for (_, alloc) in shard.drain() {
                drop(unsafe { alloc.into_box() });
            }
        });
    }

    #[test]
    fn test_shard_distribution() {
        let table = NodeTable::new(4);
        assert_eq!(table.num_shards(), 16);
        let h1 = Hash128::new(0x1, 0);
        let h2 = Hash128::new(0x2, 0);
        assert_ne!(table.shard_index(h1), table.shard_index(h2));
    }

    #[test]
    fn test_mutex_pool_masks_index() {
        let pool = MutexPool::new(3);
        assert_eq!(pool.num_mutexes(), 8);
        // Any u32 maps to a valid mutex.
        let _g = pool.mutex(u32::MAX).lock();
    }
}
