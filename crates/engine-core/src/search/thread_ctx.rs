//! Per-search-thread mutable context.
//!
//! Each worker owns one of these for the duration of a search task: a
//! scratch board/history it replays descents on, a deterministic RNG, an
//! evaluation buffer, stat scratch sized to the policy, and the deferred
//! cleanup list for replaced nn outputs.

use std::collections::HashSet;
use std::sync::Arc;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::board::{Board, BoardHistory};
use crate::eval::{NnOutput, NnResultBuf};
use crate::types::{Hash128, Player};

use super::engine::Search;
use super::stats::MoreNodeStats;

pub struct SearchThread {
    pub thread_idx: usize,
    pub pla: Player,
    pub board: Board,
    pub history: BoardHistory,
    pub graph_hash: Hash128,
    pub rand: Xoshiro256PlusPlus,
    pub nn_result_buf: NnResultBuf,
    /// Scratch for recomputing node stats, sized to the policy length.
    pub stats_buf: Vec<MoreNodeStats>,
    /// Scratch marking which policy positions already have a child.
    pub poses_with_child_buf: Vec<bool>,
    /// Best-effort visit bound used by futile-visit pruning this descent.
    pub upper_bound_visits_left: f64,
    /// Replaced nn-output handles that other threads may still be reading;
    /// freed by the search after all threads quiesce.
    pub old_nn_outputs_to_clean_up: Vec<Box<Arc<NnOutput>>>,
    /// Rate-limits illegal-move warnings to once per nn result per search.
    pub illegal_move_hashes: HashSet<Hash128>,
}

impl SearchThread {
    pub fn new(thread_idx: usize, search: &Search) -> SearchThread {
        let seed = make_seed(search, thread_idx);
        let policy_size = search.policy_size();
        SearchThread {
            thread_idx,
            pla: search.root_pla(),
            board: search.root_board().clone(),
            history: search.root_history().clone(),
            graph_hash: search.root_graph_hash(),
            rand: Xoshiro256PlusPlus::seed_from_u64(seed),
            nn_result_buf: NnResultBuf::default(),
            stats_buf: vec![MoreNodeStats::default(); policy_size],
            poses_with_child_buf: vec![false; policy_size],
            upper_bound_visits_left: 1e30,
            old_nn_outputs_to_clean_up: Vec::with_capacity(8),
            illegal_move_hashes: HashSet::new(),
        }
    }

    /// Reset the mutable position state back to the root between playouts.
    pub fn reset_to_root(&mut self, search: &Search) {
        self.pla = search.root_pla();
        self.board.clone_from(search.root_board());
        self.history.clone_from(search.root_history());
        self.graph_hash = search.root_graph_hash();
    }
}

/// Deterministic per-thread seed from the search seed, thread index, root
/// position, move count, and search counter.
fn make_seed(search: &Search, thread_idx: usize) -> u64 {
    let mut h = Hash128::ZERO;
    for chunk in search.rand_seed().as_bytes().chunks(8) {
        let mut v = 0u64;
        for (i, b) in chunk.iter().enumerate() {
            v |= (*b as u64) << (8 * i);
        }
        h = h.mix(v);
    }
    h = h.mix(thread_idx as u64);
    h = h.mix(search.root_board().pos_hash.hash0);
    h = h.mix(search.root_history().move_history.len() as u64);
    h = h.mix(search.num_searches_begun() as u64);
    h.hash0 ^ h.hash1.rotate_left(17)
}
