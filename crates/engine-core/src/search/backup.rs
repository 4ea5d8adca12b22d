//! Backup: leaf-value accumulation and lock-light recomputation of a
//! node's aggregate stats from its children.
//!
//! Backup coalescing works through `dirty_counter`: every completing
//! playout increments it, and only the thread that incremented it from
//! zero recomputes, draining any increments that arrived meanwhile. That
//! makes the recomputation single-writer without a mutex and without lost
//! updates.

use std::sync::atomic::Ordering;

use super::engine::Search;
use super::node::SearchNode;
use super::stats::{MoreNodeStats, NodeStats};
use super::thread_ctx::SearchThread;

/// Degrees of freedom of the t-distribution used for value-based child
/// downweighting.
const VALUE_WEIGHT_DEGREES_OF_FREEDOM: f64 = 3.0;

/// CDF of the t-distribution with 3 degrees of freedom (closed form).
fn tdist3_cdf(x: f64) -> f64 {
    let z = x / VALUE_WEIGHT_DEGREES_OF_FREEDOM.sqrt();
    0.5 + std::f64::consts::FRAC_1_PI * (z / (1.0 + z * z) + z.atan())
}

impl Search {
    /// Evaluator-confidence weight of a direct evaluation.
    pub fn compute_weight_from_nn_output(&self, nn: &crate::eval::NnOutput) -> f64 {
        let params = self.params();
        if !params.use_uncertainty || !self.nn_evaluator().supports_shortterm_error() {
            return 1.0;
        }
        let score_mean = nn.white_score_mean as f64;
        let utility_uncertainty_wl =
            params.win_loss_utility_factor * nn.shortterm_winloss_error as f64;
        let utility_uncertainty_score = self.get_approx_score_utility_derivative(score_mean)
            * nn.shortterm_score_error as f64;
        let utility_uncertainty = utility_uncertainty_wl + utility_uncertainty_score;

        let powered_uncertainty = if params.uncertainty_exponent == 1.0 {
            utility_uncertainty
        } else if params.uncertainty_exponent == 0.5 {
            utility_uncertainty.sqrt()
        } else {
            utility_uncertainty.powf(params.uncertainty_exponent)
        };

        let baseline_uncertainty = params.uncertainty_coeff / params.uncertainty_max_weight;
        params.uncertainty_coeff / (powered_uncertainty + baseline_uncertainty)
    }

    /// Add a leaf value into a node's running averages.
    #[allow(clippy::too_many_arguments)]
    pub fn add_leaf_value(
        &self,
        node: &SearchNode,
        win_loss_value: f64,
        no_result_value: f64,
        score_mean: f64,
        score_mean_sq: f64,
        lead: f64,
        weight: f64,
        is_terminal: bool,
        assume_no_existing_weight: bool,
    ) {
        let params = self.params();
        let mut utility = self.get_result_utility(win_loss_value, no_result_value)
            + self.get_score_utility(score_mean, score_mean_sq);

        if params.subtree_value_bias_factor != 0.0 && !is_terminal {
            if let Some(entry) = &node.subtree_value_bias_entry {
                utility += entry.bias(params.subtree_value_bias_factor);
            }
        }

        utility += self.get_pattern_bonus(node.pattern_bonus_hash, node.next_pla.opp());

        let utility_sq = utility * utility;
        let weight_sq = weight * weight;
        let stats = &node.stats;

        if assume_no_existing_weight {
            node.stats_lock.lock();
            stats.win_loss_value_avg.store(win_loss_value, Ordering::Release);
            stats.no_result_value_avg.store(no_result_value, Ordering::Release);
            stats.score_mean_avg.store(score_mean, Ordering::Release);
            stats.score_mean_sq_avg.store(score_mean_sq, Ordering::Release);
            stats.lead_avg.store(lead, Ordering::Release);
            stats.utility_avg.store(utility, Ordering::Release);
            stats.utility_sq_avg.store(utility_sq, Ordering::Release);
            stats.weight_sq_sum.store(weight_sq, Ordering::Release);
            stats.weight_sum.store(weight, Ordering::Release);
            let old_visits = stats.visits.fetch_add(1, Ordering::Release);
            node.stats_lock.unlock();
            debug_assert_eq!(old_visits, 0);
        } else {
            node.stats_lock.lock();
            let old_weight_sum = stats.weight_sum.load(Ordering::Relaxed);
            let new_weight_sum = old_weight_sum + weight;
            let mix = |avg: &super::stats::AtomicF64, v: f64| {
                let updated =
                    (avg.load(Ordering::Relaxed) * old_weight_sum + v * weight) / new_weight_sum;
                avg.store(updated, Ordering::Release);
            };
            mix(&stats.win_loss_value_avg, win_loss_value);
            mix(&stats.no_result_value_avg, no_result_value);
            mix(&stats.score_mean_avg, score_mean);
            mix(&stats.score_mean_sq_avg, score_mean_sq);
            mix(&stats.lead_avg, lead);
            mix(&stats.utility_avg, utility);
            mix(&stats.utility_sq_avg, utility_sq);
            stats
                .weight_sq_sum
                .store(stats.weight_sq_sum.load(Ordering::Relaxed) + weight_sq, Ordering::Release);
            stats.weight_sum.store(new_weight_sum, Ordering::Release);
            stats.visits.fetch_add(1, Ordering::Release);
            node.stats_lock.unlock();
        }
    }

    /// Add the node's own current evaluation as a leaf value.
    pub fn add_current_nn_output_as_leaf_value(
        &self,
        node: &SearchNode,
        assume_no_existing_weight: bool,
    ) {
        let nn = node
            .nn_output()
            .expect("node must have an nn output to add as leaf value");
        // All values in the search are from white's perspective.
        let win_prob = nn.white_win_prob as f64;
        let loss_prob = nn.white_loss_prob as f64;
        let no_result_prob = nn.white_no_result_prob as f64;
        let score_mean = nn.white_score_mean as f64;
        let score_mean_sq = nn.white_score_mean_sq as f64;
        let lead = nn.white_lead as f64;
        let weight = self.compute_weight_from_nn_output(&nn);
        self.add_leaf_value(
            node,
            win_prob - loss_prob,
            no_result_prob,
            score_mean,
            score_mean_sq,
            lead,
            weight,
            false,
            assume_no_existing_weight,
        );
    }

    /// Coalesced backup. The thread that takes the counter from zero does
    /// the recomputation and keeps draining until no increments remain.
    pub fn update_stats_after_playout(
        &self,
        node: &SearchNode,
        thread: &mut SearchThread,
        is_root: bool,
    ) {
        let old_dirty_counter = node.dirty_counter.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old_dirty_counter >= 0);
        if old_dirty_counter > 0 {
            return;
        }
        let mut num_visits_completed: i32 = 1;
        loop {
            self.recompute_node_stats(node, thread, num_visits_completed as i64, is_root);
            let old = node
                .dirty_counter
                .fetch_add(-num_visits_completed, Ordering::AcqRel);
            let new_dirty_counter = old - num_visits_completed;
            if new_dirty_counter <= 0 {
                debug_assert_eq!(new_dirty_counter, 0);
                break;
            }
            num_visits_completed = new_dirty_counter;
        }
    }

    /// Recompute all child-dependent stats of a node, and add
    /// `num_visits_to_add` visits. Assumes the node has an nn output.
    pub fn recompute_node_stats(
        &self,
        node: &SearchNode,
        thread: &mut SearchThread,
        num_visits_to_add: i64,
        is_root: bool,
    ) {
        let params = self.params();
        let children = node.children();

        let mut num_good_children = 0;
        let mut orig_total_child_weight = 0.0;
        for slot in children {
            let child = match slot.get_if_allocated() {
                Some(c) => c,
                None => break,
            };
            let move_loc = slot.move_loc_relaxed();
            let edge_visits = slot.edge_visits();
            let stats = child.stats.snapshot();
            if stats.visits <= 0 || stats.weight_sum <= 0.0 || edge_visits <= 0 {
                continue;
            }
            let child_weight = stats.weight_sum * (edge_visits as f64 / stats.visits as f64);
            let child_utility = stats.utility_avg;
            let entry = &mut thread.stats_buf[num_good_children];
            entry.stats = stats;
            entry.self_utility = node.next_pla.white_sign() * child_utility;
            entry.weight_adjusted = child_weight;
            entry.prev_move_loc = move_loc;
            orig_total_child_weight += child_weight;
            num_good_children += 1;
        }

        let mut current_total_child_weight = orig_total_child_weight;

        if params.use_noise_pruning
            && num_good_children > 0
            && !(params.anti_mirror && self.mirroring_pla().is_some())
        {
            let mut policy_probs_buf = vec![0.0f64; num_good_children];
            {
                let nn = node
                    .nn_output_handle()
                    .expect("node with children must have an nn output");
                let policy_probs = nn.policy_probs_maybe_noised();
                for i in 0..num_good_children {
                    let pos = self.get_pos(thread.stats_buf[i].prev_move_loc);
                    policy_probs_buf[i] = (policy_probs[pos] as f64).max(1e-30);
                }
            }
            current_total_child_weight = self.prune_noise_weight(
                &mut thread.stats_buf[..num_good_children],
                current_total_child_weight,
                &policy_probs_buf,
            );
        }

        {
            let mut amount_to_subtract = 0.0;
            let mut amount_to_prune = 0.0;
            if is_root && params.root_noise_enabled && !params.use_noise_pruning {
                let max_child_weight = thread.stats_buf[..num_good_children]
                    .iter()
                    .fold(0.0f64, |m, s| m.max(s.weight_adjusted));
                amount_to_subtract = params.chosen_move_subtract.min(max_child_weight / 64.0);
                amount_to_prune = params.chosen_move_prune.min(max_child_weight / 64.0);
            }
            current_total_child_weight = self.downweight_bad_children_and_normalize_weight(
                &mut thread.stats_buf[..num_good_children],
                current_total_child_weight,
                current_total_child_weight,
                amount_to_subtract,
                amount_to_prune,
            );
        }

        let mut win_loss_value_sum = 0.0;
        let mut no_result_value_sum = 0.0;
        let mut score_mean_sum = 0.0;
        let mut score_mean_sq_sum = 0.0;
        let mut lead_sum = 0.0;
        let mut utility_sum = 0.0;
        let mut utility_sq_sum = 0.0;
        let mut weight_sq_sum = 0.0;
        let mut weight_sum = current_total_child_weight;
        for entry in &thread.stats_buf[..num_good_children] {
            let stats: &NodeStats = &entry.stats;
            let desired_weight = entry.weight_adjusted;
            let weight_scaling = desired_weight / stats.weight_sum;

            win_loss_value_sum += desired_weight * stats.win_loss_value_avg;
            no_result_value_sum += desired_weight * stats.no_result_value_avg;
            score_mean_sum += desired_weight * stats.score_mean_avg;
            score_mean_sq_sum += desired_weight * stats.score_mean_sq_avg;
            lead_sum += desired_weight * stats.lead_avg;
            utility_sum += desired_weight * stats.utility_avg;
            utility_sq_sum += desired_weight * stats.utility_sq_avg;
            weight_sq_sum += weight_scaling * weight_scaling * stats.weight_sq_sum;
        }

        // The node's own direct evaluation contributes as one more child,
        // shifted by the shared value-bias correction.
        {
            let nn = node
                .nn_output()
                .expect("recomputing stats requires an nn output");
            let win_prob = nn.white_win_prob as f64;
            let loss_prob = nn.white_loss_prob as f64;
            let no_result_prob = nn.white_no_result_prob as f64;
            let score_mean = nn.white_score_mean as f64;
            let score_mean_sq = nn.white_score_mean_sq as f64;
            let lead = nn.white_lead as f64;
            let mut utility = self.get_result_utility(win_prob - loss_prob, no_result_prob)
                + self.get_score_utility(score_mean, score_mean_sq);

            if params.subtree_value_bias_factor != 0.0 {
                if let Some(entry) = &node.subtree_value_bias_entry {
                    let (new_delta_sum, new_weight_sum);
                    if current_total_child_weight > 1e-10 {
                        let utility_children = utility_sum / current_total_child_weight;
                        let bias_weight = orig_total_child_weight
                            .powf(params.subtree_value_bias_weight_exponent);
                        let bias_delta_sum = (utility_children - utility) * bias_weight;

                        let mut sums = entry.sums.lock();
                        sums.delta_utility_sum += bias_delta_sum
                            - node.last_subtree_value_bias_delta_sum.load(Ordering::Relaxed);
                        sums.weight_sum += bias_weight
                            - node.last_subtree_value_bias_weight.load(Ordering::Relaxed);
                        new_delta_sum = sums.delta_utility_sum;
                        new_weight_sum = sums.weight_sum;
                        drop(sums);
                        node.last_subtree_value_bias_delta_sum
                            .store(bias_delta_sum, Ordering::Relaxed);
                        node.last_subtree_value_bias_weight
                            .store(bias_weight, Ordering::Relaxed);
                    } else {
                        let sums = entry.sums.lock();
                        new_delta_sum = sums.delta_utility_sum;
                        new_weight_sum = sums.weight_sum;
                    }
                    if new_weight_sum > 0.001 {
                        utility +=
                            params.subtree_value_bias_factor * new_delta_sum / new_weight_sum;
                    }
                }
            }

            let weight = self.compute_weight_from_nn_output(&nn);
            win_loss_value_sum += (win_prob - loss_prob) * weight;
            no_result_value_sum += no_result_prob * weight;
            score_mean_sum += score_mean * weight;
            score_mean_sq_sum += score_mean_sq * weight;
            lead_sum += lead * weight;
            utility_sum += utility * weight;
            utility_sq_sum += utility * utility * weight;
            weight_sq_sum += weight * weight;
            weight_sum += weight;
        }

        let win_loss_value_avg = win_loss_value_sum / weight_sum;
        let no_result_value_avg = no_result_value_sum / weight_sum;
        let score_mean_avg = score_mean_sum / weight_sum;
        let score_mean_sq_avg = score_mean_sq_sum / weight_sum;
        let lead_avg = lead_sum / weight_sum;
        let mut utility_avg = utility_sum / weight_sum;
        let mut utility_sq_avg = utility_sq_sum / weight_sum;

        let old_utility_avg = utility_avg;
        utility_avg += self.get_pattern_bonus(node.pattern_bonus_hash, node.next_pla.opp());
        utility_sq_avg += utility_avg * utility_avg - old_utility_avg * old_utility_avg;

        let stats = &node.stats;
        node.stats_lock.lock();
        stats.win_loss_value_avg.store(win_loss_value_avg, Ordering::Release);
        stats.no_result_value_avg.store(no_result_value_avg, Ordering::Release);
        stats.score_mean_avg.store(score_mean_avg, Ordering::Release);
        stats.score_mean_sq_avg.store(score_mean_sq_avg, Ordering::Release);
        stats.lead_avg.store(lead_avg, Ordering::Release);
        stats.utility_avg.store(utility_avg, Ordering::Release);
        stats.utility_sq_avg.store(utility_sq_avg, Ordering::Release);
        stats.weight_sq_sum.store(weight_sq_sum, Ordering::Release);
        stats.weight_sum.store(weight_sum, Ordering::Release);
        stats.visits.fetch_add(num_visits_to_add, Ordering::Release);
        node.stats_lock.unlock();
    }

    /// Downweight children whose own utility is worse than the weighted
    /// average of earlier (higher-policy) siblings when they hold more than
    /// a lenient policy share of the weight. Returns the new total weight.
    pub fn prune_noise_weight(
        &self,
        stats_buf: &mut [MoreNodeStats],
        total_child_weight: f64,
        policy_probs_buf: &[f64],
    ) -> f64 {
        let params = self.params();
        let num_children = stats_buf.len();
        if num_children <= 1 || total_child_weight <= 0.00001 {
            return total_child_weight;
        }

        // Children are close to policy-sorted in practice; treating them as
        // sorted is accurate enough for this pruning.
        let mut utility_sum_so_far = 0.0;
        let mut weight_sum_so_far = 0.0;
        let mut raw_policy_sum_so_far = 0.0;
        for i in 0..num_children {
            let utility = stats_buf[i].self_utility;
            let old_weight = stats_buf[i].weight_adjusted;
            let raw_policy = policy_probs_buf[i];

            let mut new_weight = old_weight;
            if weight_sum_so_far > 0.0 && raw_policy_sum_so_far > 0.0 {
                let avg_utility_so_far = utility_sum_so_far / weight_sum_so_far;
                let utility_gap = avg_utility_so_far - utility;
                if utility_gap > 0.0 {
                    let weight_share_from_raw_policy =
                        weight_sum_so_far * raw_policy / raw_policy_sum_so_far;
                    // More than double its proper share marks an outlier.
                    let lenient_share = 2.0 * weight_share_from_raw_policy;
                    if old_weight > lenient_share {
                        let excess_weight = old_weight - lenient_share;
                        let mut weight_to_subtract = excess_weight
                            * (1.0 - (-utility_gap / params.noise_prune_utility_scale).exp());
                        if weight_to_subtract > params.noise_pruning_cap {
                            weight_to_subtract = params.noise_pruning_cap;
                        }
                        new_weight = old_weight - weight_to_subtract;
                        stats_buf[i].weight_adjusted = new_weight;
                    }
                }
            }
            utility_sum_so_far += utility * new_weight;
            weight_sum_so_far += new_weight;
            raw_policy_sum_so_far += raw_policy;
        }
        weight_sum_so_far
    }

    /// Value-based downweighting: children with utility z-scores below the
    /// weighted mean lose weight by the t-distribution CDF raised to
    /// `value_weight_exponent`, then everything renormalizes to the desired
    /// total. Returns the new total weight (the desired total).
    pub fn downweight_bad_children_and_normalize_weight(
        &self,
        stats_buf: &mut [MoreNodeStats],
        current_total_weight: f64,
        desired_total_weight: f64,
        amount_to_subtract: f64,
        amount_to_prune: f64,
    ) -> f64 {
        let params = self.params();
        let num_children = stats_buf.len();
        if num_children == 0 || current_total_weight <= 0.0 {
            return current_total_weight;
        }
        let mut current_total_weight = current_total_weight;

        if params.value_weight_exponent == 0.0 || self.mirroring_pla().is_some() {
            for entry in stats_buf.iter_mut() {
                if entry.weight_adjusted < amount_to_prune {
                    current_total_weight -= entry.weight_adjusted;
                    entry.weight_adjusted = 0.0;
                    continue;
                }
                let new_weight = entry.weight_adjusted - amount_to_subtract;
                if new_weight <= 0.0 {
                    current_total_weight -= entry.weight_adjusted;
                    entry.weight_adjusted = 0.0;
                } else {
                    current_total_weight -= amount_to_subtract;
                    entry.weight_adjusted = new_weight;
                }
            }
            if current_total_weight != desired_total_weight && current_total_weight > 0.0 {
                let factor = desired_total_weight / current_total_weight;
                for entry in stats_buf.iter_mut() {
                    entry.weight_adjusted *= factor;
                }
            }
            return desired_total_weight;
        }

        let mut stdevs = vec![0.0f64; num_children];
        let mut simple_value_sum = 0.0;
        for (i, entry) in stats_buf.iter().enumerate() {
            debug_assert!(entry.stats.visits >= 0);
            if entry.stats.visits == 0 {
                continue;
            }
            let weight = entry.weight_adjusted;
            let precision = 1.5 * weight.sqrt();
            // A floor on the variance keeps the z-scores stable however the
            // precision formula changes.
            const MIN_VARIANCE: f64 = 0.00000001;
            stdevs[i] = (MIN_VARIANCE + 1.0 / precision).sqrt();
            simple_value_sum += entry.self_utility * weight;
        }
        let simple_value = simple_value_sum / current_total_weight;

        let mut total_new_unnorm_weight = 0.0;
        for (i, entry) in stats_buf.iter_mut().enumerate() {
            if entry.stats.visits == 0 {
                continue;
            }
            if entry.weight_adjusted < amount_to_prune {
                current_total_weight -= entry.weight_adjusted;
                entry.weight_adjusted = 0.0;
                continue;
            }
            let new_weight = entry.weight_adjusted - amount_to_subtract;
            if new_weight <= 0.0 {
                current_total_weight -= entry.weight_adjusted;
                entry.weight_adjusted = 0.0;
            } else {
                current_total_weight -= amount_to_subtract;
                entry.weight_adjusted = new_weight;
            }

            let z = (entry.self_utility - simple_value) / stdevs[i];
            // A tiny floor keeps fully-rejected children from zeroing out.
            let p = tdist3_cdf(z) + 0.0001;
            entry.weight_adjusted *= p.powf(params.value_weight_exponent);
            total_new_unnorm_weight += entry.weight_adjusted;
        }

        debug_assert!(total_new_unnorm_weight > 0.0);
        let factor = desired_total_weight / total_new_unnorm_weight;
        for entry in stats_buf.iter_mut() {
            entry.weight_adjusted *= factor;
        }
        desired_total_weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tdist3_cdf_shape() {
        assert!((tdist3_cdf(0.0) - 0.5).abs() < 1e-12);
        assert!(tdist3_cdf(5.0) > 0.98);
        assert!(tdist3_cdf(-5.0) < 0.02);
        assert!((tdist3_cdf(2.0) + tdist3_cdf(-2.0) - 1.0).abs() < 1e-12);
        let mut prev = 0.0;
        for i in -40..=40 {
            let v = tdist3_cdf(i as f64 / 4.0);
            assert!(v > prev);
            prev = v;
        }
    }
}
