//! The playout engine: one root-to-leaf descent plus backup.
//!
//! A playout returns `true` when it completed a visit and `false` when it
//! lost a race (evaluator install, state CAS, slot publication, capacity
//! growth) and should be retried from the root. Retries do not consume a
//! playout count.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::warn;

use crate::board::{GraphHash, ScoreValue};
use crate::eval::{NnInputParams, NnOutput};
use crate::types::{Hash128, Loc, Player};

use super::engine::Search;
use super::node::{self, SearchNode};
use super::thread_ctx::SearchThread;

/// Salt xored into graph hashes of nodes that must not be treated as
/// terminal, so they never share identity with their terminal twins.
const FORCE_NON_TERMINAL_HASH: Hash128 = Hash128 {
    hash0: 0xd4c31800cb8809e2,
    hash1: 0xf75f9d2083f2ffca,
};

impl Search {
    /// Run one playout from the root. Returns whether a visit completed.
    pub fn run_single_playout(
        &self,
        thread: &mut SearchThread,
        upper_bound_visits_left: f64,
    ) -> bool {
        thread.upper_bound_visits_left = upper_bound_visits_left;
        let root = self
            .root_node_ref()
            .expect("search must have a root node during playouts");
        let finished = self.playout_descend(thread, root, true);
        thread.reset_to_root(self);
        finished
    }

    pub(super) fn create_mutex_idx_for_node(&self, thread: &mut SearchThread) -> u32 {
        use rand::Rng;
        thread.rand.gen::<u32>() & (self.mutex_pool().num_mutexes() as u32 - 1)
    }

    /// Find or create the node for the position the thread's board now
    /// shows. Must be called after making the child move.
    pub(super) fn allocate_or_find_node(
        &self,
        thread: &mut SearchThread,
        next_pla: Player,
        best_child_move_loc: Loc,
        force_non_terminal: bool,
        graph_hash: Hash128,
    ) -> *mut SearchNode {
        use rand::Rng;
        let params = self.params();
        let child_hash = if params.use_graph_search {
            if force_non_terminal {
                graph_hash ^ FORCE_NON_TERMINAL_HASH
            } else {
                graph_hash
            }
        } else {
            // Random salt keeps every node unique: transposition disabled.
            thread.board.pos_hash
                ^ Hash128::new(thread.rand.gen::<u64>(), thread.rand.gen::<u64>())
        };

        let mutex_idx = self.create_mutex_idx_for_node(thread);
        let (ptr, _was_new) = self.node_table().find_or_insert_with(child_hash, || {
            let mut child = SearchNode::new(next_pla, force_non_terminal, mutex_idx);
            // Shared-table bookkeeping must be fully formed before other
            // threads can reach this node through the table.
            if params.subtree_value_bias_factor != 0.0 {
                if let Some(table) = self.subtree_value_bias_table() {
                    let hist = &thread.history.move_history;
                    if hist.len() >= 2 {
                        let prev_move_loc = hist[hist.len() - 2].loc;
                        if prev_move_loc != Loc::NULL {
                            child.subtree_value_bias_entry = Some(table.get(
                                thread.pla.opp(),
                                prev_move_loc,
                                best_child_move_loc,
                                thread.history.get_recent_board(1),
                            ));
                        }
                    }
                }
            }
            if self.pattern_bonus_table().is_some() {
                child.pattern_bonus_hash = super::pattern_bonus::PatternBonusTable::get_hash(
                    thread.pla.opp(),
                    best_child_move_loc,
                    thread.history.get_recent_board(1),
                );
            }
            child
        });
        ptr
    }

    /// Terminal leaf value for the thread's finished game.
    fn add_terminal_leaf_value(&self, thread: &SearchThread, node: &SearchNode) {
        let params = self.params();
        // Pace terminal evaluations like real ones so one thread cannot
        // flood visits while others sit in a device batch.
        self.nn_evaluator().wait_for_next_nn_eval_if_any();
        let uncertainty_weight =
            if params.use_uncertainty && self.nn_evaluator().supports_shortterm_error() {
                params.uncertainty_max_weight
            } else {
                1.0
            };
        if thread.history.is_no_result {
            self.add_leaf_value(node, 0.0, 1.0, 0.0, 0.0, 0.0, uncertainty_weight, true, false);
        } else {
            let win_loss_value = 2.0
                * ScoreValue::white_wins_of_winner(
                    thread.history.winner,
                    params.draw_equivalent_wins_for_white,
                )
                - 1.0;
            let score_mean = ScoreValue::white_score_draw_adjust(
                thread.history.final_white_minus_black_score,
                params.draw_equivalent_wins_for_white,
                &thread.history,
            );
            let score_mean_sq = ScoreValue::white_score_mean_sq_of_score_gridded(
                thread.history.final_white_minus_black_score,
                params.draw_equivalent_wins_for_white,
            );
            let lead = score_mean;
            self.add_leaf_value(
                node,
                win_loss_value,
                0.0,
                score_mean,
                score_mean_sq,
                lead,
                uncertainty_weight,
                true,
                false,
            );
        }
    }

    /// Evaluate the node with the external evaluator and install the
    /// result.
    ///
    /// With `is_re_init` false the first installer wins and also records
    /// the initial leaf value; with `is_re_init` true the result always
    /// replaces the existing output and no visit is recorded. Returns true
    /// if an output was set where there was none.
    pub(super) fn init_node_nn_output(
        &self,
        thread: &mut SearchThread,
        node: &SearchNode,
        is_root: bool,
        skip_cache: bool,
        is_re_init: bool,
    ) -> bool {
        let params = self.params();
        let mut include_owner_map = is_root || self.always_include_owner_map();
        // A mirroring opponent holding the center: value estimates need the
        // ownership of the center to be trusted at all.
        let center_loc = Loc::center(thread.board.x_size, thread.board.y_size);
        let anti_mirror_difficult = params.anti_mirror
            && self.mirroring_pla().is_some()
            && self.mirror_advantage() >= -0.5
            && center_loc != Loc::NULL
            && thread.board.color(center_loc).player() == Some(self.root_pla().opp())
            && self.is_mirroring_since_search_start(&thread.history, 4);
        if anti_mirror_difficult {
            include_owner_map = true;
        }
        let mut nn_input_params = NnInputParams {
            draw_equivalent_wins_for_white: params.draw_equivalent_wins_for_white,
            conservative_pass: params.conservative_pass,
            nn_policy_temperature: params.nn_policy_temperature,
            avoid_dagger_hack: params.avoid_dagger_hack_pla == Some(thread.pla),
            playout_doubling_advantage: 0.0,
            symmetry: 0,
        };
        if params.playout_doubling_advantage != 0.0 {
            let advantage_pla = self.playout_doubling_advantage_pla();
            nn_input_params.playout_doubling_advantage = if Some(thread.pla.opp()) == advantage_pla
            {
                -params.playout_doubling_advantage
            } else {
                params.playout_doubling_advantage
            };
        }

        let mut result: Arc<NnOutput> = if is_root && params.root_num_symmetries_to_sample > 1 {
            use rand::Rng;
            let mut outputs = Vec::with_capacity(params.root_num_symmetries_to_sample);
            let mut symmetry_indexes: Vec<usize> = (0..crate::board::NUM_SYMMETRIES).collect();
            for i in 0..params
                .root_num_symmetries_to_sample
                .min(crate::board::NUM_SYMMETRIES)
            {
                let j = thread.rand.gen_range(i..crate::board::NUM_SYMMETRIES);
                symmetry_indexes.swap(i, j);
                nn_input_params.symmetry = symmetry_indexes[i];
                // No guarantee which symmetry a cache holds.
                let skip_cache_this_iteration = true;
                self.nn_evaluator().evaluate(
                    &thread.board,
                    &thread.history,
                    thread.pla,
                    &nn_input_params,
                    &mut thread.nn_result_buf,
                    skip_cache_this_iteration,
                    include_owner_map,
                );
                outputs.push(thread.nn_result_buf.result.take().expect("evaluator must fill buf"));
            }
            Arc::new(NnOutput::average(&outputs))
        } else {
            self.nn_evaluator().evaluate(
                &thread.board,
                &thread.history,
                thread.pla,
                &nn_input_params,
                &mut thread.nn_result_buf,
                skip_cache,
                include_owner_map,
            );
            thread.nn_result_buf.result.take().expect("evaluator must fill buf")
        };

        if anti_mirror_difficult {
            if let Some(owner_map) = result.white_owner_map.clone() {
                // Shift the winrate by the center ownership: holding the
                // center is most of what decides a mirror game.
                let mut adjusted = (*result).clone();
                let center_pos = self.get_pos(center_loc);
                let total_wl_prob =
                    (adjusted.white_win_prob + adjusted.white_loss_prob) as f64;
                let own_scale = if self.mirror_center_symmetry_error() <= 0.0 {
                    0.7
                } else {
                    0.3
                };
                let mut wl = (adjusted.white_win_prob - adjusted.white_loss_prob) as f64
                    / (total_wl_prob + 1e-10);
                wl = wl.clamp(-1.0 + 1e-15, 1.0 - 1e-15);
                wl = (wl.atanh() + own_scale * owner_map[center_pos] as f64).tanh();
                let white_new_win_prob = total_wl_prob * (0.5 + 0.5 * wl);
                adjusted.white_win_prob = white_new_win_prob as f32;
                adjusted.white_loss_prob = (total_wl_prob - white_new_win_prob) as f32;
                result = Arc::new(adjusted);
            }
        }

        if let Some(noised) = self.maybe_add_policy_noise_and_temp(thread, is_root, &result) {
            result = (*noised).clone();
        }

        node.node_age.store(self.search_node_age(), Ordering::Release);
        if is_re_init {
            // No visit or stat updates: the next backup repairs the small
            // value drift from the fresh evaluation.
            node.store_nn_output(Box::new(result), &mut thread.old_nn_outputs_to_clean_up)
        } else {
            match node.store_nn_output_if_null(Box::new(result)) {
                Ok(()) => {
                    self.add_current_nn_output_as_leaf_value(node, true);
                    true
                }
                Err(_lost) => false,
            }
        }
    }

    /// Root refresh: once per search generation, rebuild the root's nn
    /// output if the new search needs something the cached one lacks
    /// (ownership map, conservative-pass handling, symmetry averaging,
    /// noise/temperature).
    pub(super) fn maybe_recompute_existing_nn_output(
        &self,
        thread: &mut SearchThread,
        node: &SearchNode,
        is_root: bool,
    ) {
        if !is_root || node.node_age.load(Ordering::Acquire) == self.search_node_age() {
            return;
        }
        // First thread to bump the age does the update; later threads do
        // not wait and may briefly search with the stale policy.
        let old_age = node
            .node_age
            .swap(self.search_node_age(), Ordering::AcqRel);
        if old_age >= self.search_node_age() {
            return;
        }
        let params = self.params();
        let nn = node
            .nn_output()
            .expect("expanded root must have an nn output");
        let needs_full_recompute = nn.white_owner_map.is_none()
            || (params.conservative_pass
                && thread.history.pass_would_end_game(&thread.board, thread.pla))
            || params.root_num_symmetries_to_sample > 1;
        if needs_full_recompute {
            self.init_node_nn_output(thread, node, is_root, false, true);
        } else if let Some(noised) = self.maybe_add_policy_noise_and_temp(thread, is_root, &nn) {
            node.store_nn_output(noised, &mut thread.old_nn_outputs_to_clean_up);
        }
    }

    /// The recursive descent. See the module docs for the retry contract.
    pub fn playout_descend(
        &self,
        thread: &mut SearchThread,
        node: &SearchNode,
        is_root: bool,
    ) -> bool {
        let params = self.params();

        // Terminal: the game ended on the thread's board and nothing forces
        // this node to stay open.
        if thread.history.is_game_finished && !node.force_non_terminal {
            self.add_terminal_leaf_value(thread, node);
            return true;
        }

        let mut node_state = node.state();
        if node_state == node::STATE_UNEVALUATED {
            // Always attempt the evaluation: a slow or wedged device on the
            // thread that got here first must not block everyone else.
            if !self.init_node_nn_output(thread, node, is_root, false, false) {
                return false;
            }
            if !node.cas_state(node::STATE_UNEVALUATED, node::STATE_EVALUATING) {
                // Someone else is transitioning; retry from the root.
                return false;
            }
            node.initialize_children();
            node.store_state(node::STATE_EXPANDED0);
            return true;
        } else if node_state == node::STATE_EVALUATING {
            // Another thread's evaluation is in flight.
            return false;
        }
        debug_assert!(node_state >= node::STATE_EXPANDED0);

        self.maybe_recompute_existing_nn_output(thread, node, is_root);

        let mut child: Option<&SearchNode> = None;
        let mut best_child_idx_final = 0usize;
        loop {
            let (mut num_children_found, mut best_child_idx, mut best_child_move_loc) =
                self.select_best_child_to_descend(thread, node, node_state, is_root);

            // The absurdly rare case that the chosen move is not legal:
            // a hash collision, a stale cached policy, or a graph-search
            // cycle interacting with superko. Regenerate the evaluation and
            // select again.
            if best_child_idx.is_some()
                && !thread
                    .history
                    .is_legal(&thread.board, best_child_move_loc, thread.pla)
            {
                self.init_node_nn_output(thread, node, is_root, true, true);
                {
                    let nn_hash = node
                        .nn_output_handle()
                        .map(|nn| nn.nn_hash)
                        .unwrap_or(Hash128::ZERO);
                    // A cycle or bad transposition can fire this every
                    // playout; warn once per nn result per search.
                    if thread.illegal_move_hashes.insert(nn_hash) {
                        warn!("chosen move not legal so regenerated nn output, nnhash={nn_hash}");
                    }
                }

                node_state = node.state();
                let reselected = self.select_best_child_to_descend(thread, node, node_state, is_root);
                num_children_found = reselected.0;
                best_child_idx = reselected.1;
                best_child_move_loc = reselected.2;
                if let Some(idx) = best_child_idx {
                    if idx >= num_children_found {
                        // Could still be illegal if we raced a re-init based
                        // on an older cached output. Fail and retry.
                        if !thread
                            .history
                            .is_legal(&thread.board, best_child_move_loc, thread.pla)
                        {
                            return false;
                        }
                    } else {
                        // An illegal move got into the tree (cycle or bad
                        // transposition). Count the edge so other branches
                        // keep making progress.
                        let children = node.children_for_state(node_state);
                        debug_assert!(children.len() > idx);
                        children[idx].add_edge_visits(1);
                        return true;
                    }
                }
            }

            let (num_children_found, best_child_idx, best_child_move_loc) = match best_child_idx {
                Some(idx) => (num_children_found, idx, best_child_move_loc),
                None => {
                    // Every move is forbidden; the node just accumulates
                    // visits on its own evaluation.
                    self.add_current_nn_output_as_leaf_value(node, false);
                    return true;
                }
            };

            if best_child_idx >= num_children_found {
                // A new child.
                debug_assert_eq!(best_child_idx, num_children_found);
                if !node
                    .maybe_expand_children_capacity_for_new_child(&mut node_state, num_children_found + 1)
                {
                    // Another thread is growing the arrays.
                    std::thread::yield_now();
                    node_state = node.state();
                    continue;
                }
                let children = node.children_for_state(node_state);
                debug_assert!(children.len() > best_child_idx);

                // Make the move first: the child's identity hash needs the
                // resulting position.
                thread.history.make_board_move_assume_legal(
                    &mut thread.board,
                    best_child_move_loc,
                    thread.pla,
                    false,
                );
                thread.pla = thread.pla.opp();
                if params.use_graph_search {
                    thread.graph_hash = GraphHash::extend(
                        thread.graph_hash,
                        &thread.history,
                        thread.pla,
                        params.graph_search_rep_bound,
                        params.draw_equivalent_wins_for_white,
                    );
                }

                // A pass from the root under conservative pass must stay
                // searchable past the nominal game end.
                let force_non_terminal = params.conservative_pass
                    && self.node_is_root(node)
                    && best_child_move_loc == Loc::PASS;
                let child_ptr = self.allocate_or_find_node(
                    thread,
                    thread.pla,
                    best_child_move_loc,
                    force_non_terminal,
                    thread.graph_hash,
                );
                let child_ref: &SearchNode = unsafe { &*child_ptr };
                child_ref.virtual_losses.fetch_add(1, Ordering::Release);

                {
                    // Publish the slot under the node mutex so move and
                    // pointer appear together.
                    let mutex = self.mutex_pool().mutex(node.mutex_idx);
                    let guard = mutex.lock();
                    if children[best_child_idx].get_if_allocated().is_none() {
                        children[best_child_idx].set_move_loc_relaxed(best_child_move_loc);
                        children[best_child_idx].store(child_ptr);
                        drop(guard);
                    } else {
                        // Someone beat us to the slot, and we already made
                        // our move; fail the playout and retry. A newly
                        // allocated node is left for the next sweep.
                        drop(guard);
                        child_ref.virtual_losses.fetch_add(-1, Ordering::Release);
                        return false;
                    }
                }

                if self.maybe_catch_up_edge_visits(thread, node, child_ref, node_state, best_child_idx) {
                    self.update_stats_after_playout(node, thread, is_root);
                    child_ref.virtual_losses.fetch_add(-1, Ordering::Release);
                    return true;
                }
                child = Some(child_ref);
                best_child_idx_final = best_child_idx;
            } else {
                // An existing child.
                let children = node.children_for_state(node_state);
                let child_ref = children[best_child_idx]
                    .get_if_allocated()
                    .expect("selected existing child must be allocated");
                child_ref.virtual_losses.fetch_add(1, Ordering::Release);

                if self.maybe_catch_up_edge_visits(thread, node, child_ref, node_state, best_child_idx) {
                    self.update_stats_after_playout(node, thread, is_root);
                    child_ref.virtual_losses.fetch_add(-1, Ordering::Release);
                    return true;
                }

                thread.history.make_board_move_assume_legal(
                    &mut thread.board,
                    best_child_move_loc,
                    thread.pla,
                    false,
                );
                thread.pla = thread.pla.opp();
                if params.use_graph_search {
                    thread.graph_hash = GraphHash::extend(
                        thread.graph_hash,
                        &thread.history,
                        thread.pla,
                        params.graph_search_rep_bound,
                        params.draw_equivalent_wins_for_white,
                    );
                }
                child = Some(child_ref);
                best_child_idx_final = best_child_idx;
            }
            break;
        }

        let child = child.expect("descent loop must produce a child");
        let finished_playout = self.playout_descend(thread, child, false);
        if finished_playout {
            let node_state = node.state();
            let children = node.children_for_state(node_state);
            children[best_child_idx_final].add_edge_visits(1);
            self.update_stats_after_playout(node, thread, is_root);
        }
        child.virtual_losses.fetch_add(-1, Ordering::Release);
        finished_playout
    }

    /// Edge-visit reconciliation: when this edge has fewer visits than the
    /// child node accumulated through other parents, count this playout as
    /// an edge traversal without descending. Returns true if the catch-up
    /// consumed the playout.
    fn maybe_catch_up_edge_visits(
        &self,
        thread: &mut SearchThread,
        node: &SearchNode,
        child: &SearchNode,
        node_state: u32,
        best_child_idx: usize,
    ) -> bool {
        use rand::Rng;
        let params = self.params();
        let children = node.children_for_state(node_state);
        let child_visits = child.stats.visits.load(Ordering::Acquire);
        let mut edge_visits = children[best_child_idx].edge_visits();

        // Optionally keep exploring the transposition anyway some of the
        // time, so shared subtrees still deepen.
        if params.graph_search_catch_up_leak_prob > 0.0
            && edge_visits < child_visits
            && thread.rand.gen_bool(params.graph_search_catch_up_leak_prob)
        {
            return false;
        }

        let num_to_add: i64 = 1;
        loop {
            if edge_visits >= child_visits {
                return false;
            }
            let new_edge_visits = edge_visits + num_to_add;
            if children[best_child_idx]
                .compare_exchange_weak_edge_visits(&mut edge_visits, new_edge_visits)
            {
                return true;
            }
        }
    }
}
