//! The `Search` owner type: root configuration, root preparation, tree
//! reuse across moves, and the whole-search supervision loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::board::{Board, BoardHistory, GraphHash, Rules, ScoringRule};
use crate::eval::{NnEvaluator, NnInputParams, NnOutput, NnResultBuf};
use crate::types::{Color, Hash128, Loc, NnPos, Player};

use super::maintenance::NodePtrList;
use super::node::SearchNode;
use super::node_table::{MutexPool, NodeAlloc, NodeTable};
use super::params::SearchParams;
use super::pattern_bonus::PatternBonusTable;
use super::stats::AtomicF64;
use super::thread_ctx::SearchThread;
use super::thread_pool::SearchThreadPool;
use super::time_manager::{TimeControls, UnlimitedTimeControls, NO_VISITS_BOUND};
use super::value_bias::SubtreeValueBiasTable;

/// Node ages above this trigger a full clear instead of risking rollover.
const NODE_AGE_ROLLOVER_LIMIT: u32 = 0x3FFF_FFFF;

/// How often thread 0 re-estimates the time limit, in seconds.
const TIME_RECOMPUTE_INTERVAL: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// The evaluator cannot handle a board of this size.
    BoardTooLarge {
        nn_x_len: usize,
        nn_y_len: usize,
        x_size: usize,
        y_size: usize,
    },
    /// A worker thread died to a panic during the search.
    WorkerFailed,
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::BoardTooLarge {
                nn_x_len,
                nn_y_len,
                x_size,
                y_size,
            } => write!(
                f,
                "evaluator supports up to {nn_x_len}x{nn_y_len} but was asked to search {x_size}x{y_size}"
            ),
            SearchError::WorkerFailed => write!(f, "search worker thread failed"),
        }
    }
}

impl std::error::Error for SearchError {}

pub struct Search {
    root_pla: Player,
    root_board: Board,
    root_history: BoardHistory,
    root_graph_hash: Hash128,
    root_hint_loc: Loc,
    avoid_move_until_by_loc_black: Vec<i32>,
    avoid_move_until_by_loc_white: Vec<i32>,
    root_symmetries: Vec<usize>,
    root_prune_only_symmetries: Vec<usize>,
    root_sym_dup_loc: Vec<bool>,
    root_safe_area: Vec<Color>,
    recent_score_center: f64,
    mirroring_pla: Option<Player>,
    mirror_advantage: f64,
    mirror_center_symmetry_error: f64,
    always_include_owner_map: bool,

    params: SearchParams,
    num_searches_begun: u32,
    search_node_age: u32,
    pla_that_search_is_for: Option<Player>,
    pla_that_search_is_for_last_search: Option<Player>,
    last_search_num_playouts: i64,
    effective_search_time_carried_over: f64,
    rand_seed: String,
    non_search_rand: Xoshiro256PlusPlus,

    root_node: Option<NodeAlloc>,
    node_table: NodeTable,
    mutex_pool: MutexPool,
    nn_evaluator: Arc<dyn NnEvaluator>,
    nn_x_len: usize,
    nn_y_len: usize,
    policy_size: usize,

    subtree_value_bias_table: Option<SubtreeValueBiasTable>,
    pattern_bonus_table: Option<PatternBonusTable>,
    external_pattern_bonus_table: Option<PatternBonusTable>,

    pool: Option<SearchThreadPool>,
    old_nn_outputs_to_clean_up: Mutex<Vec<Box<Arc<NnOutput>>>>,
}

impl fmt::Debug for Search {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Search").finish_non_exhaustive()
    }
}

impl Search {
    pub fn new(
        params: SearchParams,
        nn_evaluator: Arc<dyn NnEvaluator>,
        rand_seed: &str,
        board: Board,
        pla: Player,
        rules: Rules,
    ) -> Result<Search, SearchError> {
        let nn_x_len = nn_evaluator.nn_x_len();
        let nn_y_len = nn_evaluator.nn_y_len();
        if board.x_size > nn_x_len || board.y_size > nn_y_len {
            return Err(SearchError::BoardTooLarge {
                nn_x_len,
                nn_y_len,
                x_size: board.x_size,
                y_size: board.y_size,
            });
        }
        let policy_size = NnPos::policy_size(nn_x_len, nn_y_len);
        let history = BoardHistory::new(&board, pla, rules, 0);
        let num_points = board.num_points();

        let mut seed_hash = Hash128::ZERO;
        for b in rand_seed.as_bytes() {
            seed_hash = seed_hash.mix(*b as u64);
        }
        let node_table = NodeTable::new(params.node_table_shards_power_of_two);
        let mutex_pool = MutexPool::new(params.mutex_pool_size_power_of_two);

        Ok(Search {
            root_pla: pla,
            root_board: board,
            root_history: history,
            root_graph_hash: Hash128::ZERO,
            root_hint_loc: Loc::NULL,
            avoid_move_until_by_loc_black: Vec::new(),
            avoid_move_until_by_loc_white: Vec::new(),
            root_symmetries: vec![0],
            root_prune_only_symmetries: Vec::new(),
            root_sym_dup_loc: vec![false; num_points],
            root_safe_area: vec![Color::Empty; num_points],
            recent_score_center: 0.0,
            mirroring_pla: None,
            mirror_advantage: 0.0,
            mirror_center_symmetry_error: 1e10,
            always_include_owner_map: false,
            params,
            num_searches_begun: 0,
            search_node_age: 0,
            pla_that_search_is_for: None,
            pla_that_search_is_for_last_search: None,
            last_search_num_playouts: 0,
            effective_search_time_carried_over: 0.0,
            rand_seed: rand_seed.to_string(),
            non_search_rand: Xoshiro256PlusPlus::seed_from_u64(
                seed_hash.mix(0x6e6f6e5f736561).hash0,
            ),
            root_node: None,
            node_table,
            mutex_pool,
            nn_evaluator,
            nn_x_len,
            nn_y_len,
            policy_size,
            subtree_value_bias_table: None,
            pattern_bonus_table: None,
            external_pattern_bonus_table: None,
            pool: None,
            old_nn_outputs_to_clean_up: Mutex::new(Vec::new()),
        })
    }

    // ---- accessors used across the search modules ----

    #[inline]
    pub fn params(&self) -> &SearchParams {
        &self.params
    }
    #[inline]
    pub fn root_pla(&self) -> Player {
        self.root_pla
    }
    #[inline]
    pub fn root_board(&self) -> &Board {
        &self.root_board
    }
    #[inline]
    pub fn root_history(&self) -> &BoardHistory {
        &self.root_history
    }
    #[inline]
    pub fn root_graph_hash(&self) -> Hash128 {
        self.root_graph_hash
    }
    #[inline]
    pub fn root_hint_loc(&self) -> Loc {
        self.root_hint_loc
    }
    #[inline]
    pub fn recent_score_center(&self) -> f64 {
        self.recent_score_center
    }
    #[inline]
    pub fn mirroring_pla(&self) -> Option<Player> {
        self.mirroring_pla
    }
    #[inline]
    pub fn mirror_advantage(&self) -> f64 {
        self.mirror_advantage
    }
    #[inline]
    pub fn mirror_center_symmetry_error(&self) -> f64 {
        self.mirror_center_symmetry_error
    }
    #[inline]
    pub fn always_include_owner_map(&self) -> bool {
        self.always_include_owner_map
    }
    #[inline]
    pub fn root_safe_area(&self) -> &[Color] {
        &self.root_safe_area
    }
    #[inline]
    pub fn root_sym_dup_loc(&self) -> &[bool] {
        &self.root_sym_dup_loc
    }
    #[inline]
    pub fn root_symmetries(&self) -> &[usize] {
        &self.root_symmetries
    }
    #[inline]
    pub fn nn_evaluator(&self) -> &dyn NnEvaluator {
        &*self.nn_evaluator
    }
    #[inline]
    pub fn nn_x_len(&self) -> usize {
        self.nn_x_len
    }
    #[inline]
    pub fn nn_y_len(&self) -> usize {
        self.nn_y_len
    }
    #[inline]
    pub fn policy_size(&self) -> usize {
        self.policy_size
    }
    #[inline]
    pub fn rand_seed(&self) -> &str {
        &self.rand_seed
    }
    #[inline]
    pub fn num_searches_begun(&self) -> u32 {
        self.num_searches_begun
    }
    #[inline]
    pub fn search_node_age(&self) -> u32 {
        self.search_node_age
    }
    #[inline]
    pub fn effective_search_time_carried_over(&self) -> f64 {
        self.effective_search_time_carried_over
    }
    #[inline]
    pub fn last_search_num_playouts(&self) -> i64 {
        self.last_search_num_playouts
    }
    #[inline]
    pub(super) fn node_table(&self) -> &NodeTable {
        &self.node_table
    }
    #[inline]
    pub(super) fn mutex_pool(&self) -> &MutexPool {
        &self.mutex_pool
    }
    #[inline]
    pub(super) fn subtree_value_bias_table(&self) -> Option<&SubtreeValueBiasTable> {
        self.subtree_value_bias_table.as_ref()
    }
    #[inline]
    pub(super) fn pattern_bonus_table(&self) -> Option<&PatternBonusTable> {
        self.pattern_bonus_table.as_ref()
    }

    #[inline]
    pub fn root_node_ref(&self) -> Option<&SearchNode> {
        self.root_node.as_ref().map(|alloc| alloc.get())
    }

    #[inline]
    pub(super) fn root_node_ptr(&self) -> Option<*mut SearchNode> {
        self.root_node.as_ref().map(|alloc| alloc.0)
    }

    #[inline]
    pub fn node_is_root(&self, node: &SearchNode) -> bool {
        self.root_node
            .as_ref()
            .map(|alloc| std::ptr::eq(alloc.0, node))
            .unwrap_or(false)
    }

    pub(super) fn avoid_move_until_by_loc(&self, pla: Player) -> &Vec<i32> {
        match pla {
            Player::Black => &self.avoid_move_until_by_loc_black,
            Player::White => &self.avoid_move_until_by_loc_white,
        }
    }

    pub fn get_pattern_bonus(&self, hash: Hash128, prev_move_pla: Player) -> f64 {
        match &self.pattern_bonus_table {
            Some(table) if Some(prev_move_pla) == self.pla_that_search_is_for => {
                table.get(hash).utility_bonus
            }
            _ => 0.0,
        }
    }

    pub fn playout_doubling_advantage_pla(&self) -> Option<Player> {
        self.params
            .playout_doubling_advantage_pla
            .or(self.pla_that_search_is_for)
    }

    pub(super) fn bump_search_node_age(&mut self) {
        self.search_node_age += 1;
    }

    pub(super) fn non_search_rand_next(&mut self) -> u64 {
        self.non_search_rand.gen()
    }

    pub(super) fn non_search_rand_mut(&mut self) -> &mut Xoshiro256PlusPlus {
        &mut self.non_search_rand
    }

    /// Hand the (lazily spawned) worker pool to `f` along with a shared
    /// view of the search. The pool is moved out for the duration so the
    /// closure can freely re-borrow `self`.
    pub(super) fn with_pool<R>(&mut self, f: impl FnOnce(&Search, &SearchThreadPool) -> R) -> R {
        let mut pool = self.pool.take().unwrap_or_default();
        pool.spawn_threads_if_needed(self.params.num_threads.saturating_sub(1));
        let result = f(self, &pool);
        self.pool = Some(pool);
        result
    }

    // ---- root configuration setters ----

    pub fn set_position(&mut self, pla: Player, board: Board, history: BoardHistory) {
        self.clear_search();
        self.root_pla = pla;
        self.pla_that_search_is_for = None;
        self.root_board = board;
        self.root_history = history;
        self.avoid_move_until_by_loc_black.clear();
        self.avoid_move_until_by_loc_white.clear();
        let n = self.root_board.num_points();
        self.root_sym_dup_loc.resize(n, false);
        self.root_safe_area.resize(n, Color::Empty);
    }

    pub fn set_player_and_clear_history(&mut self, pla: Player) {
        self.clear_search();
        self.root_pla = pla;
        self.pla_that_search_is_for = None;
        self.root_board.clear_simple_ko_loc();
        let rules = self.root_history.rules.clone();
        let encore_phase = self.root_history.encore_phase;
        let board = self.root_board.clone();
        self.root_history.clear(&board, pla, rules, encore_phase);
        self.avoid_move_until_by_loc_black.clear();
        self.avoid_move_until_by_loc_white.clear();
    }

    pub fn set_player_if_new(&mut self, pla: Player) {
        if pla != self.root_pla {
            self.set_player_and_clear_history(pla);
        }
    }

    pub fn set_komi_if_new(&mut self, komi: f32) {
        if self.root_history.rules.komi != komi {
            self.clear_search();
            self.root_history.set_komi(komi);
        }
    }

    pub fn set_avoid_move_until_by_loc(&mut self, b_vec: Vec<i32>, w_vec: Vec<i32>) {
        if self.avoid_move_until_by_loc_black == b_vec && self.avoid_move_until_by_loc_white == w_vec
        {
            return;
        }
        self.clear_search();
        self.avoid_move_until_by_loc_black = b_vec;
        self.avoid_move_until_by_loc_white = w_vec;
    }

    pub fn set_root_hint_loc(&mut self, loc: Loc) {
        // A newly set hint must survive into every nn output, including the
        // noised root policy, so start from scratch.
        if loc != Loc::NULL && self.root_hint_loc != loc {
            self.clear_search();
        }
        self.root_hint_loc = loc;
    }

    pub fn set_always_include_owner_map(&mut self, b: bool) {
        if !self.always_include_owner_map && b {
            self.clear_search();
        }
        self.always_include_owner_map = b;
    }

    pub fn set_root_symmetry_pruning_only(&mut self, symmetries: Vec<usize>) {
        if self.root_prune_only_symmetries == symmetries {
            return;
        }
        self.clear_search();
        self.root_prune_only_symmetries = symmetries;
    }

    pub fn set_params(&mut self, params: SearchParams) {
        self.clear_search();
        self.params = params;
    }

    pub fn set_params_no_clearing(&mut self, params: SearchParams) {
        self.params = params;
    }

    pub fn set_external_pattern_bonus_table(&mut self, table: Option<PatternBonusTable>) {
        self.clear_search();
        self.external_pattern_bonus_table = table;
    }

    pub fn set_nn_eval(&mut self, nn_evaluator: Arc<dyn NnEvaluator>) {
        self.clear_search();
        self.nn_x_len = nn_evaluator.nn_x_len();
        self.nn_y_len = nn_evaluator.nn_y_len();
        self.policy_size = NnPos::policy_size(self.nn_x_len, self.nn_y_len);
        self.nn_evaluator = nn_evaluator;
    }

    // ---- lifecycle ----

    pub fn clear_search(&mut self) {
        self.effective_search_time_carried_over = 0.0;
        self.delete_all_table_nodes_multithreaded();
        // The root is never in the table; free it directly.
        if let Some(root) = self.root_node.take() {
            drop(unsafe { root.into_box() });
        }
        self.clear_old_nn_outputs();
        self.search_node_age = 0;
    }

    pub(super) fn clear_old_nn_outputs(&mut self) {
        self.old_nn_outputs_to_clean_up.lock().clear();
    }

    pub(super) fn transfer_old_nn_outputs(&self, thread: &mut SearchThread) {
        let mut global = self.old_nn_outputs_to_clean_up.lock();
        global.append(&mut thread.old_nn_outputs_to_clean_up);
    }

    // ---- legality at the root ----

    pub fn is_legal_tolerant(&self, move_loc: Loc, move_pla: Player) -> bool {
        // The ko point only binds the on-turn player; external drivers may
        // feed multiple moves in a row by one side.
        if move_pla != self.root_pla {
            let mut copy = self.root_board.clone();
            copy.clear_simple_ko_loc();
            copy.is_legal(move_loc, move_pla, true)
        } else {
            self.root_history.is_legal_tolerant(&self.root_board, move_loc, move_pla)
        }
    }

    pub fn is_legal_strict(&self, move_loc: Loc, move_pla: Player) -> bool {
        move_pla == self.root_pla
            && self.root_history.is_legal(&self.root_board, move_loc, move_pla)
    }

    // ---- making a move, with tree reuse ----

    pub fn make_move(&mut self, move_loc: Loc, move_pla: Player) -> bool {
        self.make_move_prevent_encore(move_loc, move_pla, false)
    }

    pub fn make_move_prevent_encore(
        &mut self,
        move_loc: Loc,
        move_pla: Player,
        prevent_encore: bool,
    ) -> bool {
        if !self.is_legal_tolerant(move_loc, move_pla) {
            return false;
        }
        if move_pla != self.root_pla {
            self.set_player_and_clear_history(move_pla);
        }

        if self.root_node.is_some() {
            let found_child_info = {
                let root = self.root_node_ref().unwrap();
                let children = root.children();
                let mut found: Option<(usize, *mut SearchNode)> = None;
                for (i, slot) in children.iter().enumerate() {
                    let child_ptr = slot.raw_ptr();
                    if child_ptr.is_null() {
                        break;
                    }
                    if found.is_none() && slot.move_loc_relaxed() == move_loc {
                        found = Some((i, child_ptr));
                    }
                }
                // A child with no nn output was preserved across a terminal
                // boundary and is worthless as a root.
                found.filter(|(_, ptr)| unsafe { &**ptr }.nn_output_handle().is_some())
            };

            if let Some((_idx, child_ptr)) = found_child_info {
                let child: &SearchNode = unsafe { &*child_ptr };
                {
                    let root = self.root_node_ref().unwrap();
                    let root_visits = root.stats.visits.load(Ordering::Acquire);
                    let child_visits = child.stats.visits.load(Ordering::Acquire);
                    let visit_proportion =
                        (child_visits as f64 / root_visits.max(1) as f64).min(1.0);
                    self.effective_search_time_carried_over = self.effective_search_time_carried_over
                        * visit_proportion
                        * self.params.tree_reuse_carry_over_time_factor;
                }

                // Promote a detached copy so the root stays out of the
                // table and can never be part of a cycle.
                let new_root = NodeAlloc::new(SearchNode::detached_copy(child, true));
                let old_root = self.root_node.replace(new_root);

                // Mark everything reachable from the new root, then sweep
                // the rest (including the promoted child's table entry).
                let new_root_ptr = self.root_node.as_ref().unwrap().0;
                self.walk_tree_multithreaded(NodePtrList(vec![new_root_ptr]), false, None);
                self.delete_all_old_or_new_table_nodes_multithreaded(true);

                if let Some(old_root) = old_root {
                    drop(unsafe { old_root.into_box() });
                }
            } else {
                self.clear_search();
            }
        }

        // A handicap-bonus change is effectively a komi change; everything
        // computed so far is wrong.
        let old_white_handicap_bonus_score = self.root_history.white_handicap_bonus_score;

        let mut board = std::mem::replace(&mut self.root_board, Board::new(2, 2));
        self.root_history
            .make_board_move_assume_legal(&mut board, move_loc, self.root_pla, prevent_encore);
        self.root_board = board;
        self.root_pla = self.root_pla.opp();

        self.avoid_move_until_by_loc_black.clear();
        self.avoid_move_until_by_loc_white.clear();

        if self.root_history.white_handicap_bonus_score != old_white_handicap_bonus_score {
            self.clear_search();
        }

        // A root pass that would end the game must not inherit subtree
        // results computed under game-continues assumptions.
        if self.params.conservative_pass
            && self
                .root_history
                .pass_would_end_game(&self.root_board, self.root_pla)
        {
            self.clear_search();
        }
        if prevent_encore
            && self
                .root_history
                .pass_would_end_phase(&self.root_board, self.root_pla)
        {
            self.clear_search();
        }

        true
    }

    // ---- root preparation ----

    fn compute_root_nn_evaluation(&self, buf: &mut NnResultBuf, include_owner_map: bool) {
        let params = &self.params;
        let mut nn_input_params = NnInputParams {
            draw_equivalent_wins_for_white: params.draw_equivalent_wins_for_white,
            conservative_pass: params.conservative_pass,
            nn_policy_temperature: params.nn_policy_temperature,
            avoid_dagger_hack: params.avoid_dagger_hack_pla == Some(self.root_pla),
            playout_doubling_advantage: 0.0,
            symmetry: 0,
        };
        if params.playout_doubling_advantage != 0.0 {
            let advantage_pla = self.playout_doubling_advantage_pla();
            nn_input_params.playout_doubling_advantage =
                if Some(self.root_pla.opp()) == advantage_pla {
                    -params.playout_doubling_advantage
                } else {
                    params.playout_doubling_advantage
                };
        }
        self.nn_evaluator.evaluate(
            &self.root_board,
            &self.root_history,
            self.root_pla,
            &nn_input_params,
            buf,
            false,
            include_owner_map,
        );
    }

    fn compute_root_values(&mut self) {
        self.root_board.calculate_area(&mut self.root_safe_area);

        // Center the dynamic score squash near the expected score, from the
        // tree when it has one, otherwise from a fresh evaluation.
        {
            let mut expected_score = None;
            if let Some(root) = self.root_node_ref() {
                let visits = root.stats.visits.load(Ordering::Acquire);
                let weight_sum = root.stats.weight_sum.load(Ordering::Acquire);
                if visits > 0 && weight_sum > 0.0 {
                    expected_score = Some(root.stats.score_mean_avg.load(Ordering::Acquire));
                }
            }
            let expected_score = match expected_score {
                Some(s) => s,
                None => {
                    let mut buf = NnResultBuf::default();
                    self.compute_root_nn_evaluation(&mut buf, true);
                    buf.result
                        .map(|out| out.white_score_mean as f64)
                        .unwrap_or(0.0)
                }
            };

            let mut center =
                expected_score * (1.0 - self.params.dynamic_score_center_zero_weight);
            let cap = (self.root_board.num_points() as f64).sqrt()
                * self.params.dynamic_score_center_scale;
            center = center.clamp(expected_score - cap, expected_score + cap);
            self.recent_score_center = center;
        }

        self.root_graph_hash = if self.params.use_graph_search {
            GraphHash::from_scratch(
                &self.root_history,
                self.root_pla,
                self.params.graph_search_rep_bound,
                self.params.draw_equivalent_wins_for_white,
            )
        } else {
            Hash128::ZERO
        };

        let opponent_was_mirroring_pla = self.mirroring_pla;
        self.mirroring_pla = None;
        self.mirror_advantage = 0.0;
        self.mirror_center_symmetry_error = 1e10;
        if self.params.anti_mirror {
            self.detect_mirroring();
        }
        // A change in mirroring status invalidates the whole tree's values.
        if opponent_was_mirroring_pla != self.mirroring_pla {
            self.clear_search();
            self.subtree_value_bias_table = None;
        }
    }

    fn detect_mirroring(&mut self) {
        let params = &self.params;
        let board = &self.root_board;
        let hist = &self.root_history;

        let mut mirror_count = 0usize;
        let mut total_count = 0usize;
        let mut mirror_ewms = 0.0f64;
        let mut total_ewms = 0.0f64;
        let mut last_was_mirror = false;
        for i in 1..hist.move_history.len() {
            if hist.move_history[i].pla != self.root_pla {
                last_was_mirror = false;
                if hist.move_history[i].loc
                    == hist.move_history[i - 1].loc.mirror(board.x_size, board.y_size)
                {
                    mirror_count += 1;
                    mirror_ewms += 1.0;
                    last_was_mirror = true;
                }
                total_count += 1;
                total_ewms += 1.0;
                mirror_ewms *= params.anti_mirror_ewms_decay;
                total_ewms *= params.anti_mirror_ewms_decay;
            }
        }

        // Most of the game mirrored, much of the recent game mirrored, and
        // the very last reply mirrored.
        if (mirror_count as f64)
            >= params.anti_mirror_count_base + params.anti_mirror_count_prop * total_count as f64
            && mirror_ewms >= params.anti_mirror_ewms_prop * total_ewms
            && last_was_mirror
        {
            self.mirroring_pla = Some(self.root_pla.opp());

            let mut black_extra_points = 0.0f64;
            let num_handicap_stones = hist.compute_num_handicap_stones();
            if hist.rules.scoring_rule == ScoringRule::Area {
                if num_handicap_stones > 0 {
                    black_extra_points += (num_handicap_stones - 1) as f64;
                }
                let black_gets_last_move = (board.x_size % 2 == 1 && board.y_size % 2 == 1)
                    == (num_handicap_stones == 0 || num_handicap_stones % 2 == 1);
                if black_gets_last_move {
                    black_extra_points += 1.0;
                }
            }
            if num_handicap_stones > 0 {
                match hist.rules.white_handicap_bonus_rule {
                    crate::board::HandicapBonusRule::N => {
                        black_extra_points -= num_handicap_stones as f64
                    }
                    crate::board::HandicapBonusRule::NMinusOne => {
                        black_extra_points -= (num_handicap_stones - 1) as f64
                    }
                    crate::board::HandicapBonusRule::None => {}
                }
            }
            self.mirror_advantage = if self.mirroring_pla == Some(Player::Black) {
                black_extra_points - hist.rules.komi as f64
            } else {
                hist.rules.komi as f64 - black_extra_points
            };
        }

        if board.x_size >= 7 && board.y_size >= 7 {
            let mut error = 0.0f64;
            let half_x = board.x_size / 2;
            let half_y = board.y_size / 2;
            let mut unmatched_mirror_pla_stones = 0;
            for dy in -3i32..=3 {
                for dx in -3i32..=3 {
                    let x = (half_x as i32 + dx) as usize;
                    let y = (half_y as i32 + dy) as usize;
                    let loc = Loc::from_xy(x, y, board.x_size);
                    let mirror_loc = loc.mirror(board.x_size, board.y_size);
                    if loc == mirror_loc {
                        continue;
                    }
                    let c0 = board.color(loc);
                    let c1 = board.color(mirror_loc);
                    if let Some(mirroring) = self.mirroring_pla {
                        if c0.player() == Some(mirroring.opp()) && c1.player() != Some(mirroring) {
                            error += 1.0;
                        }
                        if c0.player() == Some(mirroring) && c1 == Color::Empty {
                            unmatched_mirror_pla_stones += 1;
                        }
                    }
                }
            }
            if error > 0.0 {
                error += 0.2 * unmatched_mirror_pla_stones as f64;
            }
            if error >= 1.0 {
                error = 0.5 * error * (1.0 + error);
            }
            self.mirror_center_symmetry_error = error;
        }
    }

    /// Prepare the root for a new search: generation bookkeeping, root
    /// values, perturbation tables, symmetry pruning, root-child filtering,
    /// and stat refreshes.
    pub fn begin_search(&mut self, pondering: bool) -> Result<(), SearchError> {
        if self.root_board.x_size > self.nn_x_len || self.root_board.y_size > self.nn_y_len {
            return Err(SearchError::BoardTooLarge {
                nn_x_len: self.nn_x_len,
                nn_y_len: self.nn_y_len,
                x_size: self.root_board.x_size,
                y_size: self.root_board.y_size,
            });
        }

        self.num_searches_begun += 1;
        if self.search_node_age > NODE_AGE_ROLLOVER_LIMIT {
            self.clear_search();
        }

        if !pondering {
            self.pla_that_search_is_for = Some(self.root_pla);
        }
        // A game begun by pondering: assume "we" are the opposing side
        // until told otherwise.
        if self.pla_that_search_is_for.is_none() {
            self.pla_that_search_is_for = Some(self.root_pla.opp());
        }

        if self.pla_that_search_is_for_last_search != self.pla_that_search_is_for {
            // Root-player playout doubling needs fresh evals for the new
            // side.
            if self.params.playout_doubling_advantage != 0.0
                && self.params.playout_doubling_advantage_pla.is_none()
            {
                self.clear_search();
            }
            // Recomputing stats could fix utilities after a side swap, but
            // the playout distribution would still match the old bonuses;
            // clearing gives a clean distribution.
            if self.params.avoid_repeated_pattern_utility != 0.0
                || self.external_pattern_bonus_table.is_some()
            {
                self.clear_search();
            }
        }
        self.pla_that_search_is_for_last_search = self.pla_that_search_is_for;
        debug!(
            "beginning search {} for {:?}, pondering={pondering}",
            self.num_searches_begun, self.pla_that_search_is_for
        );

        self.clear_old_nn_outputs();
        self.compute_root_values();

        if self.params.subtree_value_bias_factor != 0.0
            && self.subtree_value_bias_table.is_none()
            && !(self.params.anti_mirror && self.mirroring_pla.is_some())
        {
            self.subtree_value_bias_table = Some(SubtreeValueBiasTable::new(
                self.params.subtree_value_bias_table_num_shards,
            ));
        }

        // Rebuild pattern bonuses for this search.
        self.pattern_bonus_table = None;
        if self.params.avoid_repeated_pattern_utility != 0.0
            || self.external_pattern_bonus_table.is_some()
        {
            let mut table = self
                .external_pattern_bonus_table
                .clone()
                .unwrap_or_default();
            if self.params.avoid_repeated_pattern_utility != 0.0 {
                let pla = self.pla_that_search_is_for.unwrap();
                let bonus = if pla == Player::White {
                    -self.params.avoid_repeated_pattern_utility
                } else {
                    self.params.avoid_repeated_pattern_utility
                };
                table.add_bonus_for_game_moves(&self.root_history, bonus, pla);
            }
            self.pattern_bonus_table = Some(table);
            // The root node itself never takes a pattern bonus.
            if let Some(root) = self.root_node.as_ref() {
                unsafe { (*root.0).pattern_bonus_hash = Hash128::ZERO };
            }
        }

        if self.params.root_symmetry_pruning {
            let avoid = match self.root_pla {
                Player::Black => &self.avoid_move_until_by_loc_black,
                Player::White => &self.avoid_move_until_by_loc_white,
            };
            let only = if self.root_prune_only_symmetries.is_empty() {
                None
            } else {
                Some(&self.root_prune_only_symmetries[..])
            };
            self.root_symmetries =
                self.root_board
                    .mark_duplicate_move_locs(only, avoid, &mut self.root_sym_dup_loc);
        } else {
            for d in self.root_sym_dup_loc.iter_mut() {
                *d = false;
            }
            self.root_symmetries = vec![0];
        }

        if self.root_node.is_none() {
            // The root lives outside the table: it can never be transposed
            // into, and it is always forced non-terminal.
            let mut dummy_thread_rand =
                Xoshiro256PlusPlus::seed_from_u64(self.non_search_rand_next());
            let mutex_idx =
                dummy_thread_rand.gen::<u32>() & (self.mutex_pool.num_mutexes() as u32 - 1);
            self.root_node = Some(NodeAlloc::new(SearchNode::new(self.root_pla, true, mutex_idx)));
        } else {
            let any_filtered = self.filter_illegal_root_children();

            if self.params.dynamic_score_utility_factor != 0.0
                || self.params.subtree_value_bias_factor != 0.0
                || self.pattern_bonus_table.is_some()
            {
                let root_ptr = self.root_node.as_ref().unwrap().0;
                self.recursively_recompute_stats(root_ptr);
                if any_filtered {
                    // The recompute marked everything reachable; filtered
                    // subtrees are old now.
                    self.delete_all_old_or_new_table_nodes_multithreaded(true);
                }
            } else if any_filtered {
                let root_ptr = self.root_node.as_ref().unwrap().0;
                self.walk_tree_multithreaded(NodePtrList(vec![root_ptr]), false, None);
                self.delete_all_old_or_new_table_nodes_multithreaded(true);
            }
        }

        if self.params.subtree_value_bias_factor != 0.0 {
            if let Some(table) = &self.subtree_value_bias_table {
                table.clear_unused_synchronous();
            }
        }

        // Mark all nodes old so stale root nn outputs refresh lazily.
        self.search_node_age += 1;
        Ok(())
    }

    /// Remove root children that are illegal or disallowed at the (new)
    /// root, fixing up the root visit count. Returns whether anything was
    /// filtered.
    fn filter_illegal_root_children(&mut self) -> bool {
        let root_pla = self.root_pla;
        let mut any_filtered = false;
        let root = self.root_node.as_ref().unwrap().get();
        let children = root.children();
        if children.is_empty() {
            return false;
        }

        // Nothing else runs during root preparation, so compacting the
        // array in place is safe even though it breaks mid-search
        // invariants.
        let mut num_good_children = 0usize;
        let mut keep: Vec<(*mut SearchNode, i64, Loc)> = Vec::new();
        for slot in children {
            let child_ptr = slot.raw_ptr();
            if child_ptr.is_null() {
                break;
            }
            let edge_visits = slot.edge_visits();
            let move_loc = slot.move_loc();
            slot.store(std::ptr::null_mut());
            slot.set_edge_visits(0);
            slot.set_move_loc(Loc::NULL);
            // Strict legality here: a graph-path oddity deeper in the tree
            // must not leak an illegal move into the root.
            if self
                .root_history
                .is_legal(&self.root_board, move_loc, root_pla)
                && self.is_allowed_root_move(move_loc)
            {
                keep.push((child_ptr, edge_visits, move_loc));
            } else {
                any_filtered = true;
            }
        }
        for (i, (ptr, edge_visits, move_loc)) in keep.iter().enumerate() {
            children[i].set_move_loc(*move_loc);
            children[i].set_edge_visits(*edge_visits);
            children[i].store(*ptr);
            num_good_children += 1;
        }

        if any_filtered {
            let new_num_visits: i64 = keep.iter().map(|(_, ev, _)| *ev).sum::<i64>() + 1;
            root.stats_lock.lock();
            root.stats.visits.store(new_num_visits, Ordering::Release);
            root.stats_lock.unlock();

            // The smaller arrays can go: every future reader synchronizes
            // with this thread before the search starts.
            root.free_unused_smaller_arrays();

            let mut dummy_thread = SearchThread::new(0, self);
            self.recompute_node_stats(root, &mut dummy_thread, 0, true);
            debug!(
                "filtered root children down to {num_good_children}, visits reset to {new_num_visits}"
            );
        }
        any_filtered
    }

    // ---- whole-search supervision ----

    pub fn run_whole_search_and_get_move(&mut self, move_pla: Player) -> Result<Loc, SearchError> {
        self.run_whole_search_for_player(move_pla, false)?;
        Ok(self.get_chosen_move_loc())
    }

    pub fn run_whole_search_for_player(
        &mut self,
        move_pla: Player,
        pondering: bool,
    ) -> Result<(), SearchError> {
        if move_pla != self.root_pla {
            self.set_player_and_clear_history(move_pla);
        }
        let should_stop_now = AtomicBool::new(false);
        self.run_whole_search(
            &should_stop_now,
            None,
            pondering,
            &UnlimitedTimeControls,
            1.0,
        )
    }

    /// Run playouts from the root until a cap fires or `should_stop_now`
    /// is set. `search_begun` is invoked once after root preparation.
    pub fn run_whole_search(
        &mut self,
        should_stop_now: &AtomicBool,
        search_begun: Option<&(dyn Fn() + Sync)>,
        pondering: bool,
        tc: &dyn TimeControls,
        search_factor: f64,
    ) -> Result<(), SearchError> {
        let timer = Instant::now();
        let num_playouts_shared = AtomicI64::new(0);

        // Root prep may clear carried-over time; do it first.
        self.begin_search(pondering)?;
        if let Some(cb) = search_begun {
            cb();
        }
        let num_non_playout_visits = self.get_root_visits();

        let params = &self.params;
        let mut max_visits = if pondering {
            params.max_visits_pondering
        } else {
            params.max_visits
        };
        let mut max_playouts = if pondering {
            params.max_playouts_pondering
        } else {
            params.max_playouts
        };
        let mut max_time = if pondering {
            params.max_time_pondering
        } else {
            params.max_time
        };

        let mut search_factor = search_factor;
        {
            // Play faster after passes, for human friendliness.
            let moves = &self.root_history.move_history;
            if !moves.is_empty() && moves[moves.len() - 1].loc == Loc::PASS {
                if moves.len() >= 3 && moves[moves.len() - 3].loc == Loc::PASS {
                    search_factor *= params.search_factor_after_two_pass;
                } else {
                    search_factor *= params.search_factor_after_one_pass;
                }
            }
            if search_factor != 1.0 {
                let cap = (1i64 << 62) as f64;
                max_visits = (cap.min(max_visits as f64 * search_factor)).ceil() as i64;
                max_playouts = (cap.min(max_playouts as f64 * search_factor)).ceil() as i64;
                max_time *= search_factor;
            }
        }

        // These two estimates do not need to stay in sync with each other.
        let tc_max_time = AtomicF64::new(1e30);
        let upper_bound_visits_left_due_to_time = AtomicF64::new(NO_VISITS_BOUND);
        let has_max_time = max_time < 1.0e12;
        let has_tc = !pondering && !tc.is_effectively_unlimited_time();
        if !pondering && (has_tc || has_max_time) {
            let root_visits =
                num_playouts_shared.load(Ordering::Relaxed) + num_non_playout_visits;
            let time_used = timer.elapsed().as_secs_f64();
            let mut tc_limit = 1e30;
            if has_tc {
                tc_limit =
                    self.recompute_search_time_limit(tc, time_used, search_factor, root_visits);
                tc_max_time.store(tc_limit, Ordering::Release);
            }
            let upper_bound = self.compute_upper_bound_visits_left_due_to_time(
                root_visits,
                time_used,
                tc_limit.min(max_time),
            );
            upper_bound_visits_left_due_to_time.store(upper_bound, Ordering::Release);
        }

        let actual_search_start_time = timer.elapsed().as_secs_f64();
        let worker_failed = self.with_pool(|this, pool| {
            let search_loop = |thread_idx: usize| {
                let mut thread = SearchThread::new(thread_idx, this);
                let mut num_playouts = num_playouts_shared.load(Ordering::Relaxed);
                let mut last_time_used_recomputing_tc_limit = 0.0f64;
                loop {
                    let time_used = if has_tc || has_max_time {
                        timer.elapsed().as_secs_f64()
                    } else {
                        0.0
                    };
                    let tc_max_time_limit = if has_tc {
                        tc_max_time.load(Ordering::Acquire)
                    } else {
                        0.0
                    };

                    let mut should_stop = num_playouts >= max_playouts
                        || num_playouts + num_non_playout_visits >= max_visits;
                    if has_max_time && num_playouts >= 2 && time_used >= max_time {
                        should_stop = true;
                    }
                    if has_tc && num_playouts >= 2 && time_used >= tc_max_time_limit {
                        should_stop = true;
                    }
                    if should_stop || should_stop_now.load(Ordering::Relaxed) {
                        should_stop_now.store(true, Ordering::Relaxed);
                        break;
                    }

                    // Thread 0 alone refreshes the time estimates, capped
                    // at ten times per second.
                    if !pondering
                        && (has_tc || has_max_time)
                        && thread_idx == 0
                        && time_used >= last_time_used_recomputing_tc_limit + TIME_RECOMPUTE_INTERVAL
                    {
                        last_time_used_recomputing_tc_limit = time_used;
                        let root_visits = num_playouts + num_non_playout_visits;
                        let mut tc_limit = 1e30;
                        if has_tc {
                            tc_limit = this.recompute_search_time_limit(
                                tc,
                                time_used,
                                search_factor,
                                root_visits,
                            );
                            tc_max_time.store(tc_limit, Ordering::Release);
                        }
                        let upper_bound = this.compute_upper_bound_visits_left_due_to_time(
                            root_visits,
                            time_used,
                            tc_limit.min(max_time),
                        );
                        upper_bound_visits_left_due_to_time.store(upper_bound, Ordering::Release);
                    }

                    let mut upper_bound_visits_left = NO_VISITS_BOUND;
                    if has_tc {
                        upper_bound_visits_left =
                            upper_bound_visits_left_due_to_time.load(Ordering::Acquire);
                    }
                    upper_bound_visits_left =
                        upper_bound_visits_left.min((max_playouts - num_playouts) as f64);
                    upper_bound_visits_left = upper_bound_visits_left
                        .min((max_visits - num_playouts - num_non_playout_visits) as f64);

                    let finished_playout =
                        this.run_single_playout(&mut thread, upper_bound_visits_left);
                    if finished_playout {
                        num_playouts =
                            num_playouts_shared.fetch_add(1, Ordering::Relaxed) + 1;
                    } else {
                        // Give other threads a chance so we become unstuck.
                        std::thread::yield_now();
                        num_playouts = num_playouts_shared.load(Ordering::Relaxed);
                    }
                }
                this.transfer_old_nn_outputs(&mut thread);
            };
            pool.perform_task_with_threads(&search_loop);
            pool.any_worker_panicked()
        });

        // The joins above synchronized every worker's writes.
        self.last_search_num_playouts = num_playouts_shared.load(Ordering::Relaxed);
        self.effective_search_time_carried_over +=
            timer.elapsed().as_secs_f64() - actual_search_start_time;

        if worker_failed {
            return Err(SearchError::WorkerFailed);
        }
        Ok(())
    }
}

impl Drop for Search {
    fn drop(&mut self) {
        self.clear_search();
    }
}
