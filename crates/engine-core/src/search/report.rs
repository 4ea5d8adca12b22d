//! Exported search results: aggregate root values, per-move play-selection
//! values, policy surprise/entropy, and chosen-move sampling.

use crate::board::ScoreValue;
use crate::types::Loc;

use super::engine::Search;
use super::node;

/// Aggregate values of a completed (or in-progress) search, clamped into
/// their contracts: `|win_loss_value| <= 1`,
/// `0 <= no_result_value <= 1 - |win_loss_value|`, and the win/loss/no-result
/// triple sums to one.
#[derive(Debug, Clone, Default)]
pub struct ReportedSearchValues {
    pub win_value: f64,
    pub loss_value: f64,
    pub no_result_value: f64,
    pub win_loss_value: f64,
    pub static_score_value: f64,
    pub dynamic_score_value: f64,
    pub expected_score: f64,
    pub expected_score_stdev: f64,
    pub lead: f64,
    pub utility: f64,
    pub weight: f64,
    pub visits: i64,
}

impl ReportedSearchValues {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        search: &Search,
        win_loss_value_avg: f64,
        no_result_value_avg: f64,
        score_mean_avg: f64,
        score_mean_sq_avg: f64,
        lead_avg: f64,
        utility_avg: f64,
        total_weight: f64,
        total_visits: i64,
    ) -> ReportedSearchValues {
        let mut win_loss_value = win_loss_value_avg;
        let mut no_result_value = no_result_value_avg;
        let score_stdev = Search::get_score_stdev(score_mean_avg, score_mean_sq_avg);
        let static_score_value = ScoreValue::expected_white_score_value(
            score_mean_avg,
            score_stdev,
            0.0,
            2.0,
            search.root_board(),
        );
        let dynamic_score_value = ScoreValue::expected_white_score_value(
            score_mean_avg,
            score_stdev,
            search.recent_score_center(),
            search.params().dynamic_score_center_scale,
            search.root_board(),
        );

        // Tiny floating point drift could push these outside their ranges.
        win_loss_value = win_loss_value.clamp(-1.0, 1.0);
        no_result_value = no_result_value.clamp(0.0, 1.0 - win_loss_value.abs());

        let win_value = (0.5 * (win_loss_value + (1.0 - no_result_value))).clamp(0.0, 1.0);
        let loss_value = (0.5 * (-win_loss_value + (1.0 - no_result_value))).clamp(0.0, 1.0);

        ReportedSearchValues {
            win_value,
            loss_value,
            no_result_value,
            win_loss_value,
            static_score_value,
            dynamic_score_value,
            expected_score: score_mean_avg,
            expected_score_stdev: score_stdev,
            lead: lead_avg,
            utility: utility_avg,
            weight: total_weight,
            visits: total_visits,
        }
    }
}

/// Per-root-child play-selection data.
#[derive(Debug, Clone, Default)]
pub struct PlaySelection {
    pub locs: Vec<Loc>,
    pub play_selection_values: Vec<f64>,
    pub visit_counts: Vec<f64>,
}

impl Search {
    /// Aggregate values at the root, when any search has happened.
    pub fn get_root_values(&self) -> Option<ReportedSearchValues> {
        let root = self.root_node_ref()?;
        let stats = root.stats.snapshot();
        if stats.visits <= 0 || stats.weight_sum <= 0.0 {
            return None;
        }
        Some(ReportedSearchValues::new(
            self,
            stats.win_loss_value_avg,
            stats.no_result_value_avg,
            stats.score_mean_avg,
            stats.score_mean_sq_avg,
            stats.lead_avg,
            stats.utility_avg,
            stats.weight_sum,
            stats.visits,
        ))
    }

    pub fn get_root_visits(&self) -> i64 {
        self.root_node_ref()
            .map(|n| n.stats.visits.load(std::sync::atomic::Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Play-selection values of the root children: the edge weight of each
    /// child, capped retrospectively by the best child's selection value,
    /// scaled so the maximum is at least `scale_max_to_at_least`. Falls
    /// back to the raw policy argmax when the root has no visited children.
    pub fn get_play_selection_values(&self, scale_max_to_at_least: f64) -> Option<PlaySelection> {
        use std::sync::atomic::Ordering;
        let root = self.root_node_ref()?;
        let node_state = root.state();
        let nn = root.nn_output();

        let mut selection = PlaySelection::default();

        if node_state >= node::STATE_EXPANDED0 && root.stats.visits.load(Ordering::Acquire) > 0 {
            let nn = nn.as_ref()?;
            let policy_probs = nn.policy_probs_maybe_noised();
            let children = root.children_for_state(node_state);

            let mut total_child_weight = 0.0;
            let mut num_children = 0;
            for slot in children {
                let child = match slot.get_if_allocated() {
                    Some(c) => c,
                    None => break,
                };
                let edge_visits = slot.edge_visits();
                let child_visits = child.stats.visits.load(Ordering::Acquire);
                let raw_weight = child.stats.weight_sum.load(Ordering::Acquire);
                total_child_weight +=
                    raw_weight * (edge_visits as f64 / child_visits.max(1) as f64);
                num_children += 1;
            }

            if num_children > 0 {
                let (_fpu, _parent_utility, _parent_weight_per_visit, parent_utility_stdev_factor) =
                    self.get_fpu_value_for_children_assume_visited(
                        root,
                        root.next_pla,
                        true,
                        1.0,
                    );

                // Best plain selection value among the children.
                let mut best_child_explore_selection_value = f64::MIN;
                for slot in children.iter().take(num_children) {
                    let child = slot.get_if_allocated().unwrap();
                    let move_loc = slot.move_loc();
                    let edge_visits = slot.edge_visits();
                    let child_visits = child.stats.visits.load(Ordering::Acquire);
                    let raw_weight = child.stats.weight_sum.load(Ordering::Acquire);
                    let child_weight =
                        raw_weight * (edge_visits as f64 / child_visits.max(1) as f64);
                    if child_visits <= 0 || child_weight <= 0.0 {
                        continue;
                    }
                    let mut child_utility = child.stats.utility_avg.load(Ordering::Acquire);
                    let ending_bonus = self.get_ending_white_score_bonus(root, move_loc);
                    if ending_bonus != 0.0 {
                        let score_mean = child.stats.score_mean_avg.load(Ordering::Acquire);
                        let score_mean_sq =
                            child.stats.score_mean_sq_avg.load(Ordering::Acquire);
                        child_utility +=
                            self.get_score_utility_diff(score_mean, score_mean_sq, ending_bonus);
                    }
                    let selection_value = self.get_explore_selection_value_raw(
                        policy_probs[self.get_pos(move_loc)] as f64,
                        total_child_weight,
                        child_weight,
                        child_utility,
                        parent_utility_stdev_factor,
                        root.next_pla,
                    );
                    if selection_value > best_child_explore_selection_value {
                        best_child_explore_selection_value = selection_value;
                    }
                }

                for slot in children.iter().take(num_children) {
                    let child = slot.get_if_allocated().unwrap();
                    let move_loc = slot.move_loc();
                    let edge_visits = slot.edge_visits();
                    let child_visits = child.stats.visits.load(Ordering::Acquire);
                    let reduced = self.get_reduced_play_selection_weight(
                        root,
                        policy_probs,
                        child,
                        move_loc,
                        total_child_weight,
                        edge_visits,
                        parent_utility_stdev_factor,
                        best_child_explore_selection_value,
                    );
                    selection.locs.push(move_loc);
                    selection.play_selection_values.push(reduced);
                    selection.visit_counts.push(child_visits as f64);
                }
            }
        }

        let max_value = selection
            .play_selection_values
            .iter()
            .fold(0.0f64, |m, &v| m.max(v));

        if max_value <= 0.0 {
            // No meaningful visits: fall back to the raw policy.
            let nn = nn.as_ref()?;
            let policy_probs = nn.policy_probs_maybe_noised();
            let mut best_pos = None;
            let mut best_prob = -1.0f32;
            for pos in 0..self.policy_size() {
                if policy_probs[pos] > best_prob {
                    let loc = crate::types::NnPos::pos_to_loc(
                        pos,
                        self.root_board().x_size,
                        self.root_board().y_size,
                        self.nn_x_len(),
                        self.nn_y_len(),
                    );
                    if loc != Loc::NULL
                        && (loc == Loc::PASS || self.is_allowed_root_move(loc))
                    {
                        best_prob = policy_probs[pos];
                        best_pos = Some(loc);
                    }
                }
            }
            let loc = best_pos?;
            return Some(PlaySelection {
                locs: vec![loc],
                play_selection_values: vec![scale_max_to_at_least.max(1.0)],
                visit_counts: vec![0.0],
            });
        }

        if max_value < scale_max_to_at_least {
            let factor = scale_max_to_at_least / max_value;
            for v in selection.play_selection_values.iter_mut() {
                *v *= factor;
            }
        }
        Some(selection)
    }

    /// Entropy of the raw root policy, entropy of the search's visit
    /// distribution, and the KL surprise of the search relative to the
    /// policy. Returns `(surprise, search_entropy, policy_entropy)`.
    pub fn get_policy_surprise_and_entropy(&self) -> Option<(f64, f64, f64)> {
        let root = self.root_node_ref()?;
        let nn = root.nn_output()?;
        let policy_probs = &nn.policy_probs;

        let selection = self.get_play_selection_values(1.0)?;
        let total: f64 = selection.play_selection_values.iter().sum();
        if total <= 0.0 {
            return None;
        }

        let mut policy_entropy = 0.0;
        for &p in policy_probs.iter().take(self.policy_size()) {
            if p > 0.0 {
                policy_entropy -= p as f64 * (p as f64).ln();
            }
        }

        let mut search_entropy = 0.0;
        let mut surprise = 0.0;
        for (i, &v) in selection.play_selection_values.iter().enumerate() {
            if v <= 0.0 {
                continue;
            }
            let pi = v / total;
            search_entropy -= pi * pi.ln();
            let pos = self.get_pos(selection.locs[i]);
            let p = (policy_probs[pos] as f64).max(1e-30);
            surprise += pi * (pi / p).ln();
        }
        Some((surprise.max(0.0), search_entropy, policy_entropy))
    }

    /// The move the search would play now: play-selection values sampled
    /// under the configured chosen-move temperature.
    pub fn get_chosen_move_loc(&mut self) -> Loc {
        let params = self.params().clone();
        let selection = match self.get_play_selection_values(1.0) {
            Some(s) if !s.locs.is_empty() => s,
            _ => return Loc::NULL,
        };
        let temperature = self.interpolate_early(
            params.chosen_move_temperature_halflife,
            params.chosen_move_temperature_early,
            params.chosen_move_temperature,
        );
        let idx = {
            let rand = self.non_search_rand_mut();
            Search::choose_index_with_temperature(
                rand,
                &selection.play_selection_values,
                temperature,
            )
        };
        selection.locs[idx]
    }
}
