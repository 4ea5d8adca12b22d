//! Time-control supervision: recommended-time shaping and the
//! visits-left-under-time estimate that drives futile-visit pruning.

use crate::board::{Board, BoardHistory};

use super::engine::Search;

/// Sentinel meaning "no bound on visits left". Consumers must check for it
/// explicitly rather than arithmetic on it.
pub const NO_VISITS_BOUND: f64 = 1e30;

/// Reference board area that the midgame turn constants are tuned for.
const REFERENCE_BOARD_AREA: f64 = 361.0;

/// Minimum seconds of thought before visit/time extrapolation is trusted.
const MIN_TIME_FOR_VISIT_ESTIMATE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBudget {
    pub min: f64,
    pub rec: f64,
    pub max: f64,
}

/// External clock policy. The search only ever asks for a recommendation
/// for the current position and whether time is effectively unlimited.
pub trait TimeControls: Send + Sync {
    fn recommend(&self, board: &Board, history: &BoardHistory, lag_buffer: f64) -> TimeBudget;

    fn is_effectively_unlimited_time(&self) -> bool;

    /// Round a planned limit up when stopping earlier would waste clock
    /// anyway (e.g. byoyomi periods). The default keeps the plan.
    fn round_up_time_limit_if_needed(&self, _lag_buffer: f64, _time_used: f64, rec: f64) -> f64 {
        rec
    }
}

/// No clock at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedTimeControls;

impl TimeControls for UnlimitedTimeControls {
    fn recommend(&self, _board: &Board, _history: &BoardHistory, _lag_buffer: f64) -> TimeBudget {
        TimeBudget {
            min: 0.0,
            rec: 1e30,
            max: 1e30,
        }
    }

    fn is_effectively_unlimited_time(&self) -> bool {
        true
    }
}

/// A fixed per-move budget.
#[derive(Debug, Clone, Copy)]
pub struct AbsoluteTimeControls {
    pub per_move_seconds: f64,
}

impl TimeControls for AbsoluteTimeControls {
    fn recommend(&self, _board: &Board, _history: &BoardHistory, lag_buffer: f64) -> TimeBudget {
        let t = (self.per_move_seconds - lag_buffer).max(0.0);
        TimeBudget {
            min: 0.0,
            rec: t,
            max: t,
        }
    }

    fn is_effectively_unlimited_time(&self) -> bool {
        false
    }
}

impl Search {
    /// Ceiling on how many more visits this search can produce before the
    /// planned time limit, extrapolated from visits so far (including
    /// thinking time carried over from tree reuse). Returns
    /// [`NO_VISITS_BOUND`] when there is nothing to extrapolate from.
    pub fn compute_upper_bound_visits_left_due_to_time(
        &self,
        root_visits: i64,
        time_used: f64,
        planned_time_limit: f64,
    ) -> f64 {
        if root_visits <= 1 {
            return NO_VISITS_BOUND;
        }
        let time_thought_so_far = self.effective_search_time_carried_over() + time_used;
        let time_left_planned = planned_time_limit - time_used;
        if time_thought_so_far < MIN_TIME_FOR_VISIT_ESTIMATE {
            return NO_VISITS_BOUND;
        }
        let proportion_left = time_left_planned / time_thought_so_far;
        (proportion_left * root_visits as f64 + self.params().num_threads as f64 - 1.0).ceil()
    }

    /// Recommended time for this search right now, after all shaping:
    /// overallocation, the midgame peak curve, obvious-move shrinking,
    /// carried-over-time softplus, round-up, the futile-visit shrink, and
    /// the min/max clamps with the external search factor.
    pub fn recompute_search_time_limit(
        &self,
        tc: &dyn TimeControls,
        time_used: f64,
        search_factor: f64,
        root_visits: i64,
    ) -> f64 {
        let params = self.params();
        let budget = tc.recommend(self.root_board(), self.root_history(), params.lag_buffer);
        let mut tc_rec = budget.rec * params.overallocate_time_factor;

        if params.midgame_time_factor != 1.0 {
            let board_area_scale =
                self.root_board().num_points() as f64 / REFERENCE_BOARD_AREA;
            let presumed_turn = (self.root_history().initial_turn_number
                + self.root_history().move_history.len() as i64)
                .max(0) as f64;

            let peak = params.midgame_turn_peak_time * board_area_scale;
            let mid_game_weight = if presumed_turn < peak {
                presumed_turn / peak
            } else {
                (-(presumed_turn - peak) / (params.endgame_turn_time_decay * board_area_scale))
                    .exp()
            }
            .clamp(0.0, 1.0);

            tc_rec *= 1.0 + mid_game_weight * (params.midgame_time_factor - 1.0);
        }

        if params.obvious_moves_time_factor < 1.0 {
            if let Some((surprise, _search_entropy, policy_entropy)) =
                self.get_policy_surprise_and_entropy()
            {
                // A confident policy with low surprise marks an obvious move.
                let by_entropy =
                    (-policy_entropy / params.obvious_moves_policy_entropy_tolerance).exp();
                let by_surprise =
                    (-surprise / params.obvious_moves_policy_surprise_tolerance).exp();
                let obviousness = by_entropy.min(by_surprise);
                tc_rec *= 1.0 + obviousness * (params.obvious_moves_time_factor - 1.0);
            }
        }

        if tc_rec > 1e-20 {
            // Softplus toward instant moves when prior thinking already
            // covers the recommendation, while keeping a little root search.
            let remaining_needed_factor =
                (tc_rec - self.effective_search_time_carried_over()) / tc_rec;
            tc_rec *= (((remaining_needed_factor * 6.0).exp() + 1.0).ln() / 6.0).min(1.0);
        }

        tc_rec = tc.round_up_time_limit_if_needed(params.lag_buffer, time_used, tc_rec);
        tc_rec = tc_rec.min(budget.max);

        // With the rounded plan fixed, check whether searching longer could
        // still change the chosen move.
        if params.futile_visits_threshold > 0.0 {
            let upper_bound_visits =
                self.compute_upper_bound_visits_left_due_to_time(root_visits, time_used, tc_rec);
            if upper_bound_visits < params.futile_visits_threshold * root_visits as f64 {
                if let Some(selection) = self.get_play_selection_values(1.0) {
                    let n = selection.play_selection_values.len();
                    if n > 0 && selection.visit_counts.len() == n {
                        let mut best_move_idx = 0;
                        let mut max_visits_idx = 0;
                        for i in 1..n {
                            if selection.play_selection_values[i]
                                > selection.play_selection_values[best_move_idx]
                            {
                                best_move_idx = i;
                            }
                            if selection.visit_counts[i] > selection.visit_counts[max_visits_idx] {
                                max_visits_idx = i;
                            }
                        }
                        if best_move_idx == max_visits_idx {
                            let required = self
                                .num_visits_needed_to_be_non_futile(
                                    selection.visit_counts[max_visits_idx],
                                );
                            let any_alternative = (0..n).any(|i| {
                                i != best_move_idx
                                    && selection.visit_counts[i] + upper_bound_visits >= required
                            });
                            if !any_alternative {
                                // Nothing can overtake: wind down to roughly
                                // the time already used.
                                tc_rec = time_used * (1.0 - 1e-10);
                            }
                        }
                    }
                }
            }
        }

        tc_rec = tc.round_up_time_limit_if_needed(params.lag_buffer, time_used, tc_rec);
        tc_rec = tc_rec.min(budget.max);

        // The search factor is allowed to violate the minimum: it is used
        // for friendliness (e.g. playing faster after passes).
        if tc_rec < budget.min {
            tc_rec = budget.min;
        }
        tc_rec *= search_factor;
        tc_rec.min(budget.max)
    }

    /// Visits a sibling needs to still plausibly become the chosen move.
    pub fn num_visits_needed_to_be_non_futile(&self, max_visits_move_visits: f64) -> f64 {
        let params = self.params();
        let required = params.futile_visits_threshold * max_visits_move_visits;
        let chosen_move_temperature = self.interpolate_early(
            params.chosen_move_temperature_halflife,
            params.chosen_move_temperature_early,
            params.chosen_move_temperature,
        );
        if chosen_move_temperature < 1e-3 {
            return required;
        }
        // Under temperature, also cap at the point where a move could never
        // exceed 1:100 odds of being sampled.
        let required_due_to_temp =
            max_visits_move_visits * 0.01f64.powf(chosen_move_temperature);
        required.min(required_due_to_temp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_controls() {
        let tc = UnlimitedTimeControls;
        assert!(tc.is_effectively_unlimited_time());
        let board = Board::new(5, 5);
        let hist = BoardHistory::new(&board, crate::types::Player::Black, Default::default(), 0);
        assert!(tc.recommend(&board, &hist, 0.0).rec >= 1e29);
    }

    #[test]
    fn test_absolute_controls_subtract_lag() {
        let tc = AbsoluteTimeControls {
            per_move_seconds: 5.0,
        };
        let board = Board::new(5, 5);
        let hist = BoardHistory::new(&board, crate::types::Player::Black, Default::default(), 0);
        let budget = tc.recommend(&board, &hist, 1.0);
        assert_eq!(budget.rec, 4.0);
        assert!(!tc.is_effectively_unlimited_time());
    }
}
