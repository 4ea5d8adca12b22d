//! Search tunables.

use serde::{Deserialize, Serialize};

use crate::types::Player;

/// Every tunable of the search core. Field groups follow the stages of a
/// playout: exploration, first-play urgency, root perturbations, weighting,
/// corrections, graph search, threading, and supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    // Exploration.
    pub cpuct_exploration: f64,
    pub cpuct_exploration_log: f64,
    pub cpuct_exploration_base: f64,
    pub cpuct_utility_stdev_prior: f64,
    pub cpuct_utility_stdev_prior_weight: f64,
    pub cpuct_utility_stdev_scale: f64,

    // First-play urgency.
    pub fpu_reduction_max: f64,
    pub fpu_loss_prop: f64,
    pub root_fpu_reduction_max: f64,
    pub root_fpu_loss_prop: f64,
    pub fpu_parent_weight: f64,

    // Utility composition.
    pub win_loss_utility_factor: f64,
    pub static_score_utility_factor: f64,
    pub dynamic_score_utility_factor: f64,
    pub dynamic_score_center_zero_weight: f64,
    pub dynamic_score_center_scale: f64,
    pub no_result_utility_for_white: f64,
    pub draw_equivalent_wins_for_white: f64,

    // Root perturbations.
    pub root_noise_enabled: bool,
    pub root_dirichlet_noise_total_concentration: f64,
    pub root_dirichlet_noise_weight: f64,
    pub root_policy_temperature: f64,
    pub root_policy_temperature_early: f64,
    pub root_num_symmetries_to_sample: usize,
    pub root_symmetry_pruning: bool,
    pub wide_root_noise: f64,
    pub root_desired_per_child_visits_coeff: f64,
    pub root_prune_useless_moves: bool,
    pub root_ending_bonus_points: f64,

    // Chosen-move sampling.
    pub chosen_move_temperature: f64,
    pub chosen_move_temperature_early: f64,
    pub chosen_move_temperature_halflife: f64,
    pub chosen_move_subtract: f64,
    pub chosen_move_prune: f64,

    // Child-weight shaping.
    pub use_noise_pruning: bool,
    pub noise_prune_utility_scale: f64,
    pub noise_pruning_cap: f64,
    pub value_weight_exponent: f64,

    // Uncertainty weighting.
    pub use_uncertainty: bool,
    pub uncertainty_coeff: f64,
    pub uncertainty_exponent: f64,
    pub uncertainty_max_weight: f64,

    // Subtree value bias.
    pub subtree_value_bias_factor: f64,
    pub subtree_value_bias_weight_exponent: f64,
    pub subtree_value_bias_free_prop: f64,
    pub subtree_value_bias_table_num_shards: usize,

    // Pattern bonus.
    pub avoid_repeated_pattern_utility: f64,

    // Graph search.
    pub use_graph_search: bool,
    pub graph_search_rep_bound: i32,
    pub graph_search_catch_up_leak_prob: f64,

    // Policy shaping at the evaluator.
    pub nn_policy_temperature: f64,
    pub conservative_pass: bool,
    pub avoid_dagger_hack_pla: Option<Player>,
    pub playout_doubling_advantage: f64,
    pub playout_doubling_advantage_pla: Option<Player>,

    // Anti-mirror. The numeric knobs are exposed because the heuristic is
    // fundamentally empirical.
    pub anti_mirror: bool,
    pub anti_mirror_ewms_decay: f64,
    pub anti_mirror_count_base: f64,
    pub anti_mirror_count_prop: f64,
    pub anti_mirror_ewms_prop: f64,

    // Threading and virtual loss.
    pub num_threads: usize,
    pub num_virtual_losses_per_thread: f64,
    pub node_table_shards_power_of_two: usize,
    pub mutex_pool_size_power_of_two: usize,

    // Supervision caps.
    pub max_visits: i64,
    pub max_playouts: i64,
    pub max_time: f64,
    pub max_visits_pondering: i64,
    pub max_playouts_pondering: i64,
    pub max_time_pondering: f64,
    pub search_factor_after_one_pass: f64,
    pub search_factor_after_two_pass: f64,
    pub tree_reuse_carry_over_time_factor: f64,
    pub overallocate_time_factor: f64,
    pub midgame_time_factor: f64,
    pub midgame_turn_peak_time: f64,
    pub endgame_turn_time_decay: f64,
    pub obvious_moves_time_factor: f64,
    pub obvious_moves_policy_entropy_tolerance: f64,
    pub obvious_moves_policy_surprise_tolerance: f64,
    pub futile_visits_threshold: f64,
    pub lag_buffer: f64,
}

impl Default for SearchParams {
    fn default() -> SearchParams {
        SearchParams {
            cpuct_exploration: 1.0,
            cpuct_exploration_log: 0.45,
            cpuct_exploration_base: 500.0,
            cpuct_utility_stdev_prior: 0.40,
            cpuct_utility_stdev_prior_weight: 2.0,
            cpuct_utility_stdev_scale: 0.85,

            fpu_reduction_max: 0.2,
            fpu_loss_prop: 0.0,
            root_fpu_reduction_max: 0.1,
            root_fpu_loss_prop: 0.0,
            fpu_parent_weight: 0.0,

            win_loss_utility_factor: 1.0,
            static_score_utility_factor: 0.1,
            dynamic_score_utility_factor: 0.3,
            dynamic_score_center_zero_weight: 0.2,
            dynamic_score_center_scale: 0.75,
            no_result_utility_for_white: 0.0,
            draw_equivalent_wins_for_white: 0.5,

            root_noise_enabled: false,
            root_dirichlet_noise_total_concentration: 10.83,
            root_dirichlet_noise_weight: 0.25,
            root_policy_temperature: 1.0,
            root_policy_temperature_early: 1.0,
            root_num_symmetries_to_sample: 1,
            root_symmetry_pruning: false,
            wide_root_noise: 0.0,
            root_desired_per_child_visits_coeff: 0.0,
            root_prune_useless_moves: false,
            root_ending_bonus_points: 0.5,

            chosen_move_temperature: 0.0,
            chosen_move_temperature_early: 0.5,
            chosen_move_temperature_halflife: 19.0,
            chosen_move_subtract: 0.0,
            chosen_move_prune: 1.0,

            use_noise_pruning: false,
            noise_prune_utility_scale: 0.15,
            noise_pruning_cap: 1e50,
            value_weight_exponent: 0.25,

            use_uncertainty: false,
            uncertainty_coeff: 0.25,
            uncertainty_exponent: 1.0,
            uncertainty_max_weight: 8.0,

            subtree_value_bias_factor: 0.0,
            subtree_value_bias_weight_exponent: 0.85,
            subtree_value_bias_free_prop: 0.8,
            subtree_value_bias_table_num_shards: 4096,

            avoid_repeated_pattern_utility: 0.0,

            use_graph_search: false,
            graph_search_rep_bound: 11,
            graph_search_catch_up_leak_prob: 0.0,

            nn_policy_temperature: 1.0,
            conservative_pass: false,
            avoid_dagger_hack_pla: None,
            playout_doubling_advantage: 0.0,
            playout_doubling_advantage_pla: None,

            anti_mirror: false,
            anti_mirror_ewms_decay: 0.75,
            anti_mirror_count_base: 7.0,
            anti_mirror_count_prop: 0.5,
            anti_mirror_ewms_prop: 0.45,

            num_threads: 1,
            num_virtual_losses_per_thread: 1.0,
            node_table_shards_power_of_two: 10,
            mutex_pool_size_power_of_two: 10,

            max_visits: i64::MAX / 2,
            max_playouts: i64::MAX / 2,
            max_time: 1e20,
            max_visits_pondering: i64::MAX / 2,
            max_playouts_pondering: i64::MAX / 2,
            max_time_pondering: 1e20,
            search_factor_after_one_pass: 1.0,
            search_factor_after_two_pass: 1.0,
            tree_reuse_carry_over_time_factor: 0.85,
            overallocate_time_factor: 1.0,
            midgame_time_factor: 1.0,
            midgame_turn_peak_time: 130.0,
            endgame_turn_time_decay: 100.0,
            obvious_moves_time_factor: 1.0,
            obvious_moves_policy_entropy_tolerance: 0.30,
            obvious_moves_policy_surprise_tolerance: 0.15,
            futile_visits_threshold: 0.0,
            lag_buffer: 0.0,
        }
    }
}

impl SearchParams {
    /// The span of possible utilities: win/loss plus both score factors.
    pub fn utility_radius(&self) -> f64 {
        self.win_loss_utility_factor
            + self.static_score_utility_factor
            + self.dynamic_score_utility_factor
    }

    /// Small convenience for tests: fixed visit cap, single thread.
    pub fn for_testing(max_visits: i64) -> SearchParams {
        SearchParams {
            max_visits,
            ..SearchParams::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let p = SearchParams::default();
        assert!(p.cpuct_exploration > 0.0);
        assert!(p.utility_radius() > 1.0);
        assert_eq!(p.num_threads, 1);
    }

    #[test]
    fn test_for_testing_caps_visits() {
        let p = SearchParams::for_testing(100);
        assert_eq!(p.max_visits, 100);
        assert!(p.max_playouts > 100);
    }
}
