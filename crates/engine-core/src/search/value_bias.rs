//! Shared subtree value-bias table.
//!
//! Nodes that share a local context (previous move, new move, and the
//! recent board around them) tend to share systematic evaluator error. Each
//! such context owns one entry accumulating the observed difference between
//! a node's children-derived utility and its direct evaluation; the running
//! quotient is then used to shift direct evaluations everywhere the context
//! recurs. Entries are fine-grained so contention stays low.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::board::Board;
use crate::types::{Hash128, Loc, Player};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueBiasKey {
    pub prev_move_pla: Player,
    pub prev_move_loc: Loc,
    pub move_loc: Loc,
    pub local_board_hash: Hash128,
}

#[derive(Debug, Default)]
pub struct ValueBiasSums {
    pub delta_utility_sum: f64,
    pub weight_sum: f64,
}

/// One shared accumulator. The mutex guards a two-field read-modify-write;
/// critical sections are a handful of arithmetic ops.
#[derive(Debug, Default)]
pub struct ValueBiasEntry {
    pub sums: Mutex<ValueBiasSums>,
}

impl ValueBiasEntry {
    /// Current bias quotient, or 0 when the entry has negligible weight.
    pub fn bias(&self, bias_factor: f64) -> f64 {
        let sums = self.sums.lock();
        if sums.weight_sum > 0.001 {
            bias_factor * sums.delta_utility_sum / sums.weight_sum
        } else {
            0.0
        }
    }
}

pub struct SubtreeValueBiasTable {
    shards: Vec<Mutex<HashMap<ValueBiasKey, Arc<ValueBiasEntry>>>>,
}

impl SubtreeValueBiasTable {
    pub fn new(num_shards: usize) -> SubtreeValueBiasTable {
        let n = num_shards.next_power_of_two();
        SubtreeValueBiasTable {
            shards: (0..n).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Fetch or create the entry for a local context. The local board is
    /// fingerprinted by the pattern around the new move.
    pub fn get(
        &self,
        prev_move_pla: Player,
        prev_move_loc: Loc,
        move_loc: Loc,
        recent_board: &Board,
    ) -> Arc<ValueBiasEntry> {
        let key = ValueBiasKey {
            prev_move_pla,
            prev_move_loc,
            move_loc,
            local_board_hash: recent_board.local_pattern_hash(move_loc, 3),
        };
        let idx = (key.local_board_hash.hash0 as usize
            ^ key.move_loc.0 as usize
            ^ (key.prev_move_loc.0 as usize) << 4)
            & (self.shards.len() - 1);
        let mut shard = self.shards[idx].lock();
        shard.entry(key).or_default().clone()
    }

    /// Drop entries no longer referenced by any node. Called between
    /// searches after pruning, never concurrently with search.
    pub fn clear_unused_synchronous(&self) {
        for shard in &self.shards {
            shard.lock().retain(|_, entry| Arc::strong_count(entry) > 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_context_shares_entry() {
        let table = SubtreeValueBiasTable::new(16);
        let board = Board::new(5, 5);
        let a = table.get(Player::Black, Loc(1), Loc(2), &board);
        let b = table.get(Player::Black, Loc(1), Loc(2), &board);
        assert!(Arc::ptr_eq(&a, &b));
        let c = table.get(Player::White, Loc(1), Loc(2), &board);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_bias_quotient() {
        let entry = ValueBiasEntry::default();
        assert_eq!(entry.bias(0.5), 0.0);
        {
            let mut sums = entry.sums.lock();
            sums.delta_utility_sum = 1.0;
            sums.weight_sum = 4.0;
        }
        assert_eq!(entry.bias(0.5), 0.125);
    }

    #[test]
    fn test_clear_unused() {
        let table = SubtreeValueBiasTable::new(4);
        let board = Board::new(5, 5);
        let kept = table.get(Player::Black, Loc(1), Loc(2), &board);
        let _dropped = table.get(Player::Black, Loc(3), Loc(4), &board);
        drop(_dropped);
        table.clear_unused_synchronous();
        let again = table.get(Player::Black, Loc(1), Loc(2), &board);
        assert!(Arc::ptr_eq(&kept, &again));
        // The dropped context was recreated fresh.
        let recreated = table.get(Player::Black, Loc(3), Loc(4), &board);
        assert_eq!(recreated.sums.lock().weight_sum, 0.0);
    }
}
