//! Child selection: PUCT exploration with first-play urgency, virtual-loss
//! penalties, and the root-only adjustments.

use crate::board::ScoreValue;
use crate::eval::NnOutput;
use crate::types::{Loc, NnPos, Player};

use super::engine::Search;
use super::node::SearchNode;
use super::thread_ctx::SearchThread;

/// Selection value for moves the policy marks illegal.
pub const POLICY_ILLEGAL_SELECTION_VALUE: f64 = -1e50;

/// Selection value for moves pruned as futile under the remaining-time
/// visit bound.
pub const FUTILE_VISITS_PRUNE_VALUE: f64 = -1e40;

/// Selection value that forces a move to be searched (hint clamp and
/// desired-per-child-visits clamp).
pub const FORCED_SELECTION_VALUE: f64 = 1e20;

/// Tiny constant added to the PUCT numerator so it stays positive at zero
/// visits.
const TOTAL_CHILD_WEIGHT_PUCT_OFFSET: f64 = 0.01;

impl Search {
    #[inline]
    pub fn get_result_utility(&self, win_loss_value: f64, no_result_value: f64) -> f64 {
        let params = self.params();
        win_loss_value * params.win_loss_utility_factor
            + no_result_value * params.no_result_utility_for_white
    }

    #[inline]
    pub fn get_result_utility_from_nn(&self, nn: &NnOutput) -> f64 {
        self.get_result_utility(
            (nn.white_win_prob - nn.white_loss_prob) as f64,
            nn.white_no_result_prob as f64,
        )
    }

    #[inline]
    pub fn get_score_stdev(score_mean: f64, score_mean_sq: f64) -> f64 {
        let variance = score_mean_sq - score_mean * score_mean;
        if variance <= 0.0 {
            0.0
        } else {
            variance.sqrt()
        }
    }

    pub fn get_score_utility(&self, score_mean_avg: f64, score_mean_sq_avg: f64) -> f64 {
        let params = self.params();
        let stdev = Self::get_score_stdev(score_mean_avg, score_mean_sq_avg);
        let static_value = ScoreValue::expected_white_score_value(
            score_mean_avg,
            stdev,
            0.0,
            2.0,
            self.root_board(),
        );
        let dynamic_value = ScoreValue::expected_white_score_value(
            score_mean_avg,
            stdev,
            self.recent_score_center(),
            params.dynamic_score_center_scale,
            self.root_board(),
        );
        static_value * params.static_score_utility_factor
            + dynamic_value * params.dynamic_score_utility_factor
    }

    pub fn get_score_utility_diff(
        &self,
        score_mean_avg: f64,
        score_mean_sq_avg: f64,
        delta: f64,
    ) -> f64 {
        self.get_score_utility(score_mean_avg + delta, score_mean_sq_avg)
            - self.get_score_utility(score_mean_avg, score_mean_sq_avg)
    }

    /// d(score utility)/d(score) at the mean, ignoring variance effects.
    pub fn get_approx_score_utility_derivative(&self, score_mean: f64) -> f64 {
        let params = self.params();
        let static_d =
            ScoreValue::white_d_score_value_d_score(score_mean, 0.0, 2.0, self.root_board());
        let dynamic_d = ScoreValue::white_d_score_value_d_score(
            score_mean,
            self.recent_score_center(),
            params.dynamic_score_center_scale,
            self.root_board(),
        );
        static_d * params.static_score_utility_factor
            + dynamic_d * params.dynamic_score_utility_factor
    }

    pub fn get_utility_from_nn(&self, nn: &NnOutput) -> f64 {
        self.get_result_utility_from_nn(nn)
            + self.get_score_utility(nn.white_score_mean as f64, nn.white_score_mean_sq as f64)
    }

    /// Interpolate between an early-game value and a late-game value with
    /// the given halflife in turns, normalized by board size.
    pub fn interpolate_early(&self, halflife: f64, early_value: f64, value: f64) -> f64 {
        let raw_halflives = (self.root_history().initial_turn_number as f64
            + self.root_history().move_history.len() as f64)
            / halflife;
        let halflives =
            raw_halflives * 19.0 / (self.root_board().num_points() as f64).sqrt();
        value + (early_value - value) * 0.5f64.powf(halflives)
    }

    #[inline]
    pub fn get_pos(&self, loc: Loc) -> usize {
        NnPos::loc_to_pos(loc, self.root_board().x_size, self.nn_x_len(), self.nn_y_len())
    }

    fn cpuct_exploration(&self, total_child_weight: f64) -> f64 {
        let params = self.params();
        params.cpuct_exploration
            + params.cpuct_exploration_log
                * ((total_child_weight + params.cpuct_exploration_base)
                    / params.cpuct_exploration_base)
                    .ln()
    }

    /// The raw PUCT selection value.
    pub fn get_explore_selection_value_raw(
        &self,
        nn_policy_prob: f64,
        total_child_weight: f64,
        child_weight: f64,
        child_utility: f64,
        parent_utility_stdev_factor: f64,
        pla: Player,
    ) -> f64 {
        if nn_policy_prob < 0.0 {
            return POLICY_ILLEGAL_SELECTION_VALUE;
        }
        let explore = self.cpuct_exploration(total_child_weight)
            * parent_utility_stdev_factor
            * nn_policy_prob
            * (total_child_weight + TOTAL_CHILD_WEIGHT_PUCT_OFFSET).sqrt()
            / (1.0 + child_weight);
        let value = pla.white_sign() * child_utility;
        explore + value
    }

    /// The child weight at which the raw selection value would equal
    /// `explore_selection_value`. Used to retrospectively cap play-selection
    /// weights.
    pub fn get_explore_selection_value_inverse(
        &self,
        explore_selection_value: f64,
        nn_policy_prob: f64,
        total_child_weight: f64,
        child_utility: f64,
        parent_utility_stdev_factor: f64,
        pla: Player,
    ) -> f64 {
        if nn_policy_prob < 0.0 {
            return 0.0;
        }
        let value = pla.white_sign() * child_utility;
        let explore = explore_selection_value - value;
        if explore <= 0.0 {
            return 1e100;
        }
        let scaling = self.cpuct_exploration(total_child_weight)
            * parent_utility_stdev_factor
            * nn_policy_prob
            * (total_child_weight + TOTAL_CHILD_WEIGHT_PUCT_OFFSET).sqrt();
        let child_weight = scaling / explore - 1.0;
        child_weight.max(0.0)
    }

    /// Root-only score nudges from the ownership map: discourage pointless
    /// territory filling under area scoring, encourage dame filling over
    /// passing under territory scoring.
    pub fn get_ending_white_score_bonus(&self, parent: &SearchNode, move_loc: Loc) -> f64 {
        if !self.node_is_root(parent) || move_loc == Loc::NULL {
            return 0.0;
        }
        let nn = match parent.nn_output_handle() {
            Some(nn) => nn,
            None => return 0.0,
        };
        let owner_map = match &nn.white_owner_map {
            Some(m) => m,
            None => return 0.0,
        };
        let params = self.params();
        let board = self.root_board();
        let hist = self.root_history();
        let is_area_ish = matches!(hist.rules.scoring_rule, crate::board::ScoringRule::Area)
            || hist.encore_phase >= 2;

        const EXTREME: f64 = 0.95;
        const TAIL: f64 = 0.05;

        let root_pla = self.root_pla();
        let mut extra_root_points = 0.0;
        let ownership_at = |loc: Loc| {
            let pos = self.get_pos(loc);
            let white_own = owner_map[pos] as f64;
            root_pla.white_sign() * white_own
        };

        if is_area_ish {
            if move_loc != Loc::PASS && board.ko_loc == Loc::NULL {
                let pla_ownership = ownership_at(move_loc);
                if pla_ownership <= -EXTREME {
                    extra_root_points -=
                        params.root_ending_bonus_points * ((-EXTREME - pla_ownership) / TAIL);
                } else if pla_ownership >= EXTREME
                    && !board.is_adjacent_to_pla(move_loc, root_pla.opp())
                    && !board.is_non_pass_alive_self_connection(
                        move_loc,
                        root_pla,
                        self.root_safe_area(),
                    )
                {
                    extra_root_points -=
                        params.root_ending_bonus_points * ((pla_ownership - EXTREME) / TAIL);
                }
            }
        } else if move_loc == Loc::PASS {
            extra_root_points -= params.root_ending_bonus_points * (2.0 / 3.0);
        } else if board.ko_loc == Loc::NULL {
            let pla_ownership = ownership_at(move_loc);
            if pla_ownership <= -EXTREME {
                extra_root_points -=
                    params.root_ending_bonus_points * ((-EXTREME - pla_ownership) / TAIL);
            } else if pla_ownership >= EXTREME
                && !board.is_adjacent_to_pla(move_loc, root_pla.opp())
                && !board.is_non_pass_alive_self_connection(move_loc, root_pla, self.root_safe_area())
            {
                extra_root_points -=
                    params.root_ending_bonus_points * ((pla_ownership - EXTREME) / TAIL);
            }
        }

        root_pla.white_sign() * extra_root_points
    }

    /// First-play urgency plus the parent-derived selection context.
    /// Returns `(fpu_value, parent_utility, parent_weight_per_visit,
    /// parent_utility_stdev_factor)`.
    pub fn get_fpu_value_for_children_assume_visited(
        &self,
        node: &SearchNode,
        pla: Player,
        is_root: bool,
        policy_prob_mass_visited: f64,
    ) -> (f64, f64, f64, f64) {
        let params = self.params();
        let visits = node.stats.visits.load(std::sync::atomic::Ordering::Acquire);
        let weight_sum = node.stats.weight_sum.load(std::sync::atomic::Ordering::Acquire);
        let utility_avg = node.stats.utility_avg.load(std::sync::atomic::Ordering::Acquire);
        let mut utility_sq_avg =
            node.stats.utility_sq_avg.load(std::sync::atomic::Ordering::Acquire);

        debug_assert!(visits > 0);
        debug_assert!(weight_sum > 0.0);
        let parent_weight_per_visit = weight_sum / visits as f64;
        let mut parent_utility = utility_avg;

        let variance_prior = params.cpuct_utility_stdev_prior * params.cpuct_utility_stdev_prior;
        let variance_prior_weight = params.cpuct_utility_stdev_prior_weight;
        let parent_utility_stdev = if visits <= 0 || weight_sum <= 1.0 {
            params.cpuct_utility_stdev_prior
        } else {
            let utility_sq = parent_utility * parent_utility;
            // Guard against stat desync making the variance look negative.
            if utility_sq_avg < utility_sq {
                utility_sq_avg = utility_sq;
            }
            (((utility_sq + variance_prior) * variance_prior_weight
                + utility_sq_avg * weight_sum)
                / (variance_prior_weight + weight_sum - 1.0)
                - utility_sq)
                .max(0.0)
                .sqrt()
        };
        let parent_utility_stdev_factor = 1.0
            + params.cpuct_utility_stdev_scale
                * (parent_utility_stdev / params.cpuct_utility_stdev_prior - 1.0);

        if params.fpu_parent_weight > 0.0 {
            if let Some(nn) = node.nn_output_handle() {
                parent_utility = params.fpu_parent_weight * self.get_utility_from_nn(nn)
                    + (1.0 - params.fpu_parent_weight) * parent_utility;
            }
        }

        let fpu_reduction_max = if is_root {
            params.root_fpu_reduction_max
        } else {
            params.fpu_reduction_max
        };
        let fpu_loss_prop = if is_root {
            params.root_fpu_loss_prop
        } else {
            params.fpu_loss_prop
        };
        let utility_radius = params.utility_radius();

        let reduction = fpu_reduction_max * policy_prob_mass_visited.sqrt();
        let mut fpu_value = parent_utility - pla.white_sign() * reduction;
        let loss_value = -pla.white_sign() * utility_radius;
        fpu_value += (loss_value - fpu_value) * fpu_loss_prop;

        (fpu_value, parent_utility, parent_weight_per_visit, parent_utility_stdev_factor)
    }

    /// Selection value of an existing child.
    #[allow(clippy::too_many_arguments)]
    pub fn get_explore_selection_value_of_child(
        &self,
        parent: &SearchNode,
        parent_policy_probs: &[f32],
        child: &SearchNode,
        move_loc: Loc,
        total_child_weight: f64,
        child_edge_visits: i64,
        fpu_value: f64,
        parent_utility: f64,
        parent_weight_per_visit: f64,
        parent_utility_stdev_factor: f64,
        is_during_search: bool,
        anti_mirror: bool,
        max_child_weight: f64,
        thread: &mut SearchThread,
    ) -> f64 {
        use std::sync::atomic::Ordering;
        let params = self.params();
        let move_pos = self.get_pos(move_loc);
        let mut nn_policy_prob = parent_policy_probs[move_pos];

        let child_visits = child.stats.visits.load(Ordering::Acquire);
        let raw_child_weight = child.stats.weight_sum.load(Ordering::Acquire);
        let utility_avg = child.stats.utility_avg.load(Ordering::Acquire);
        let score_mean_avg = child.stats.score_mean_avg.load(Ordering::Acquire);
        let score_mean_sq_avg = child.stats.score_mean_sq_avg.load(Ordering::Acquire);
        let child_virtual_losses = child.virtual_losses.load(Ordering::Acquire);

        let mut child_weight =
            raw_child_weight * (child_edge_visits as f64 / child_visits.max(1) as f64);

        // Visits and weight are separate atomics; either can be briefly
        // out of sync under load.
        let mut child_utility = if child_visits <= 0 || child_weight <= 0.0 {
            fpu_value
        } else {
            let mut u = utility_avg;
            let ending_bonus = self.get_ending_white_score_bonus(parent, move_loc);
            if ending_bonus != 0.0 {
                u += self.get_score_utility_diff(score_mean_avg, score_mean_sq_avg, ending_bonus);
            }
            u
        };

        let mut total_child_weight = total_child_weight;
        if total_child_weight < child_weight {
            total_child_weight = child_weight;
        }

        // Virtual losses drag the apparent utility toward a loss and add
        // phantom weight, dispersing sibling threads.
        if child_virtual_losses > 0 {
            let virtual_loss_weight =
                child_virtual_losses as f64 * params.num_virtual_losses_per_thread;
            let utility_radius = params.utility_radius();
            let virtual_loss_utility = -parent.next_pla.white_sign() * utility_radius;
            let virtual_loss_weight_frac =
                virtual_loss_weight / (virtual_loss_weight + child_weight.max(0.25));
            child_utility += (virtual_loss_utility - child_utility) * virtual_loss_weight_frac;
            child_weight += virtual_loss_weight;
        }

        if is_during_search && self.node_is_root(parent) {
            // Futile visits: skip moves that cannot accumulate the weight
            // needed to matter in the time we have left.
            if params.futile_visits_threshold > 0.0 {
                let required_weight = params.futile_visits_threshold * max_child_weight;
                let average_visits_per_weight =
                    (child_edge_visits as f64 + 1.0) / (child_weight + parent_weight_per_visit);
                let estimated_required_visits = required_weight * average_visits_per_weight;
                if (child_visits as f64) + thread.upper_bound_visits_left
                    < estimated_required_visits
                {
                    return FUTILE_VISITS_PRUNE_VALUE;
                }
            }
            // Funnel visits down every root child in rough proportion to
            // sqrt(policy).
            if params.root_desired_per_child_visits_coeff > 0.0
                && child_weight
                    < (nn_policy_prob as f64
                        * total_child_weight
                        * params.root_desired_per_child_visits_coeff)
                        .sqrt()
            {
                return FORCED_SELECTION_VALUE;
            }
            // The hint move must stay within striking distance of the most
            // searched move.
            if self.root_hint_loc() != Loc::NULL && move_loc == self.root_hint_loc() {
                let average_weight_per_visit =
                    (child_weight + parent_weight_per_visit) / (child_visits as f64 + 1.0);
                let children = parent.children();
                for slot in children {
                    let c = match slot.get_if_allocated() {
                        Some(c) => c,
                        None => break,
                    };
                    let c_edge_visits = slot.edge_visits();
                    let c_visits = c.stats.visits.load(Ordering::Acquire);
                    let raw_c_weight = c.stats.weight_sum.load(Ordering::Acquire);
                    let c_weight =
                        raw_c_weight * (c_edge_visits as f64 / c_visits.max(1) as f64);
                    if child_weight + average_weight_per_visit < c_weight * 0.8 {
                        return FORCED_SELECTION_VALUE;
                    }
                }
            }

            if params.wide_root_noise > 0.0 {
                self.maybe_apply_wide_root_noise(
                    &mut child_utility,
                    &mut nn_policy_prob,
                    parent,
                    thread,
                );
            }
        }
        if is_during_search && anti_mirror {
            self.maybe_apply_anti_mirror_policy(
                &mut nn_policy_prob,
                move_loc,
                parent_policy_probs,
                parent.next_pla,
                thread,
            );
            self.maybe_apply_anti_mirror_forced_explore(
                &mut child_utility,
                parent_utility,
                move_loc,
                parent_policy_probs,
                child_weight,
                total_child_weight,
                parent.next_pla,
                self.node_is_root(parent),
                thread,
            );
        }

        self.get_explore_selection_value_raw(
            nn_policy_prob as f64,
            total_child_weight,
            child_weight,
            child_utility,
            parent_utility_stdev_factor,
            parent.next_pla,
        )
    }

    /// Selection value of the unexpanded move with the best policy.
    #[allow(clippy::too_many_arguments)]
    pub fn get_new_explore_selection_value(
        &self,
        parent: &SearchNode,
        nn_policy_prob: f32,
        total_child_weight: f64,
        fpu_value: f64,
        parent_weight_per_visit: f64,
        parent_utility_stdev_factor: f64,
        max_child_weight: f64,
        thread: &mut SearchThread,
    ) -> f64 {
        let params = self.params();
        let child_weight = 0.0;
        let mut child_utility = fpu_value;
        let mut nn_policy_prob = nn_policy_prob;
        if self.node_is_root(parent) {
            if params.futile_visits_threshold > 0.0 {
                let average_visits_per_weight = 1.0 / parent_weight_per_visit;
                let required_weight = params.futile_visits_threshold * max_child_weight;
                let estimated_required_visits = required_weight * average_visits_per_weight;
                if thread.upper_bound_visits_left < estimated_required_visits {
                    return FUTILE_VISITS_PRUNE_VALUE;
                }
            }
            if params.wide_root_noise > 0.0 {
                self.maybe_apply_wide_root_noise(
                    &mut child_utility,
                    &mut nn_policy_prob,
                    parent,
                    thread,
                );
            }
        }
        self.get_explore_selection_value_raw(
            nn_policy_prob as f64,
            total_child_weight,
            child_weight,
            child_utility,
            parent_utility_stdev_factor,
            parent.next_pla,
        )
    }

    /// Play-selection weight for reporting: the child's weight capped at
    /// what the best child's selection value retrospectively justifies.
    #[allow(clippy::too_many_arguments)]
    pub fn get_reduced_play_selection_weight(
        &self,
        parent: &SearchNode,
        parent_policy_probs: &[f32],
        child: &SearchNode,
        move_loc: Loc,
        total_child_weight: f64,
        child_edge_visits: i64,
        parent_utility_stdev_factor: f64,
        best_child_explore_selection_value: f64,
    ) -> f64 {
        use std::sync::atomic::Ordering;
        debug_assert!(self.node_is_root(parent));
        let move_pos = self.get_pos(move_loc);
        let nn_policy_prob = parent_policy_probs[move_pos] as f64;

        let child_visits = child.stats.visits.load(Ordering::Acquire);
        let raw_child_weight = child.stats.weight_sum.load(Ordering::Acquire);
        let score_mean_avg = child.stats.score_mean_avg.load(Ordering::Acquire);
        let score_mean_sq_avg = child.stats.score_mean_sq_avg.load(Ordering::Acquire);
        let utility_avg = child.stats.utility_avg.load(Ordering::Acquire);

        let child_weight =
            raw_child_weight * (child_edge_visits as f64 / child_visits.max(1) as f64);
        if child_visits <= 0 || child_weight <= 0.0 {
            return 0.0;
        }

        let mut child_utility = utility_avg;
        let ending_bonus = self.get_ending_white_score_bonus(parent, move_loc);
        if ending_bonus != 0.0 {
            child_utility +=
                self.get_score_utility_diff(score_mean_avg, score_mean_sq_avg, ending_bonus);
        }

        let wanted = self.get_explore_selection_value_inverse(
            best_child_explore_selection_value,
            nn_policy_prob,
            total_child_weight,
            child_utility,
            parent_utility_stdev_factor,
            parent.next_pla,
        );
        child_weight.min(wanted)
    }

    fn maybe_apply_wide_root_noise(
        &self,
        child_utility: &mut f64,
        nn_policy_prob: &mut f32,
        parent: &SearchNode,
        thread: &mut SearchThread,
    ) {
        use rand::Rng;
        let params = self.params();
        // For very large wide-root noise, also smooth out the policy.
        *nn_policy_prob =
            (*nn_policy_prob as f64).powf(1.0 / (4.0 * params.wide_root_noise + 1.0)) as f32;
        if thread.rand.gen_bool(0.5) {
            let gaussian: f64 = {
                use rand_distr::{Distribution, StandardNormal};
                let x: f64 = StandardNormal.sample(&mut thread.rand);
                x
            };
            let bonus = params.wide_root_noise * gaussian.abs();
            *child_utility += parent.next_pla.white_sign() * bonus;
        }
    }

    /// The core per-node selection: scan existing children, then the best
    /// unexpanded policy move. Returns `(num_children_found, best_child_idx,
    /// best_child_move_loc)`; `best_child_idx` is `None` when every move is
    /// forbidden.
    pub fn select_best_child_to_descend(
        &self,
        thread: &mut SearchThread,
        node: &SearchNode,
        node_state: u32,
        is_root: bool,
    ) -> (usize, Option<usize>, Loc) {
        use std::sync::atomic::Ordering;
        debug_assert_eq!(thread.pla, node.next_pla);
        let params = self.params();

        let mut max_selection_value = POLICY_ILLEGAL_SELECTION_VALUE;
        let mut best_child_idx: Option<usize> = None;
        let mut best_child_move_loc = Loc::NULL;

        let children = node.children_for_state(node_state);
        let nn = node
            .nn_output_handle()
            .expect("expanded node must have an nn output");
        let policy_probs = nn.policy_probs_maybe_noised();

        let mut policy_prob_mass_visited = 0.0;
        let mut max_child_weight = 0.0;
        let mut total_child_weight = 0.0;
        for slot in children {
            let child = match slot.get_if_allocated() {
                Some(c) => c,
                None => break,
            };
            let move_loc = slot.move_loc_relaxed();
            let move_pos = self.get_pos(move_loc);
            let nn_policy_prob = policy_probs[move_pos];
            policy_prob_mass_visited += nn_policy_prob.max(0.0) as f64;

            let edge_visits = slot.edge_visits();
            let raw_child_weight = child.stats.weight_sum.load(Ordering::Acquire);
            let child_visits = child.stats.visits.load(Ordering::Acquire);
            let child_weight =
                raw_child_weight * (edge_visits as f64 / child_visits.max(1) as f64);
            total_child_weight += child_weight;
            if child_weight > max_child_weight {
                max_child_weight = child_weight;
            }
        }
        debug_assert!(policy_prob_mass_visited <= 1.0001);

        let (fpu_value, parent_utility, parent_weight_per_visit, parent_utility_stdev_factor) =
            self.get_fpu_value_for_children_assume_visited(
                node,
                thread.pla,
                is_root,
                policy_prob_mass_visited,
            );

        let policy_size = self.policy_size();
        for p in thread.poses_with_child_buf.iter_mut() {
            *p = false;
        }
        let anti_mirror = params.anti_mirror
            && self.mirroring_pla().is_some()
            && self.is_mirroring_since_search_start(&thread.history, 0);

        let mut num_children_found = 0;
        for (i, slot) in children.iter().enumerate() {
            let child = match slot.get_if_allocated() {
                Some(c) => c,
                None => break,
            };
            num_children_found += 1;
            let child_edge_visits = slot.edge_visits();
            let move_loc = slot.move_loc_relaxed();
            let selection_value = self.get_explore_selection_value_of_child(
                node,
                policy_probs,
                child,
                move_loc,
                total_child_weight,
                child_edge_visits,
                fpu_value,
                parent_utility,
                parent_weight_per_visit,
                parent_utility_stdev_factor,
                true,
                anti_mirror,
                max_child_weight,
                thread,
            );
            if selection_value > max_selection_value {
                max_selection_value = selection_value;
                best_child_idx = Some(i);
                best_child_move_loc = move_loc;
            }
            thread.poses_with_child_buf[self.get_pos(move_loc)] = true;
        }

        let avoid_move_until_by_loc = self.avoid_move_until_by_loc(thread.pla);

        // Candidate new child: the untried legal move with the best policy.
        let mut best_new_move_loc = Loc::NULL;
        let mut best_new_nn_policy_prob = -1.0f32;
        for move_pos in 0..policy_size {
            if thread.poses_with_child_buf[move_pos] {
                continue;
            }
            let move_loc = NnPos::pos_to_loc(
                move_pos,
                thread.board.x_size,
                thread.board.y_size,
                self.nn_x_len(),
                self.nn_y_len(),
            );
            if move_loc == Loc::NULL {
                continue;
            }
            if is_root {
                debug_assert_eq!(thread.board.pos_hash, self.root_board().pos_hash);
                debug_assert_eq!(thread.pla, self.root_pla());
                if !self.is_allowed_root_move(move_loc) {
                    continue;
                }
            }
            if !avoid_move_until_by_loc.is_empty() && move_loc.is_on_board() {
                let until_depth = avoid_move_until_by_loc
                    .get(move_loc.index())
                    .copied()
                    .unwrap_or(0);
                let depth =
                    thread.history.move_history.len() - self.root_history().move_history.len();
                if (depth as i32) < until_depth {
                    continue;
                }
            }

            let mut nn_policy_prob = policy_probs[move_pos];
            if anti_mirror {
                self.maybe_apply_anti_mirror_policy(
                    &mut nn_policy_prob,
                    move_loc,
                    policy_probs,
                    node.next_pla,
                    thread,
                );
            }
            if nn_policy_prob > best_new_nn_policy_prob {
                best_new_nn_policy_prob = nn_policy_prob;
                best_new_move_loc = move_loc;
            }
        }
        if best_new_move_loc != Loc::NULL {
            let selection_value = self.get_new_explore_selection_value(
                node,
                best_new_nn_policy_prob,
                total_child_weight,
                fpu_value,
                parent_weight_per_visit,
                parent_utility_stdev_factor,
                max_child_weight,
                thread,
            );
            if selection_value > max_selection_value {
                best_child_idx = Some(num_children_found);
                best_child_move_loc = best_new_move_loc;
            }
        }

        (num_children_found, best_child_idx, best_child_move_loc)
    }

    /// Root move filtering: pass-alive-area pruning after repeated opponent
    /// passes, and symmetry-duplicate pruning.
    pub fn is_allowed_root_move(&self, move_loc: Loc) -> bool {
        let params = self.params();
        debug_assert!(move_loc == Loc::PASS || self.root_board().is_on_board(move_loc));

        // If the opponent's last four moves were all passes, never play
        // inside either side's safe area: it only prolongs finished games.
        if params.root_prune_useless_moves
            && !self.root_history().move_history.is_empty()
            && move_loc != Loc::PASS
        {
            let hist = &self.root_history().move_history;
            let last = hist.len() - 1;
            let opp = self.root_pla().opp();
            if last >= 6 {
                let all_opp_passes = [0usize, 2, 4, 6].iter().all(|&k| {
                    let m = &hist[last - k];
                    m.loc == Loc::PASS && m.pla == opp
                });
                if all_opp_passes {
                    let safe = self.root_safe_area()[move_loc.index()];
                    if safe == crate::types::Color::of(opp)
                        || safe == crate::types::Color::of(self.root_pla())
                    {
                        return false;
                    }
                }
            }
        }

        if params.root_symmetry_pruning
            && move_loc != Loc::PASS
            && self.root_sym_dup_loc()[move_loc.index()]
        {
            return false;
        }
        true
    }
}
