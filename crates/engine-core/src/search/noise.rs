//! Root policy perturbations: temperature, Dirichlet noise, and the
//! hint-move shift. All of them operate on a cloned nn output whose
//! `noised_policy_probs` extension carries the modified policy; the
//! value-bearing fields stay untouched.

use rand::Rng;
use rand_distr::{Distribution, Gamma};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;

use crate::eval::NnOutput;
use crate::types::Loc;

use super::engine::Search;
use super::params::SearchParams;
use super::thread_ctx::SearchThread;

/// Split the Dirichlet concentration: half uniform over legal moves, half
/// shaped by how far each move's log-policy sits above the mean. Returns
/// per-position alpha proportions (summing to 1 over legal moves).
pub fn compute_dirichlet_alpha_distribution(
    policy_size: usize,
    policy_probs: &[f32],
    alpha_distr: &mut [f64],
) {
    let legal_count = policy_probs[..policy_size]
        .iter()
        .filter(|p| **p >= 0.0)
        .count();
    assert!(legal_count > 0, "no move with nonnegative policy value");

    let mut log_policy_sum = 0.0;
    for i in 0..policy_size {
        if policy_probs[i] >= 0.0 {
            alpha_distr[i] = ((policy_probs[i] as f64).min(0.01) + 1e-20).ln();
            log_policy_sum += alpha_distr[i];
        }
    }
    let log_policy_mean = log_policy_sum / legal_count as f64;
    let mut alpha_prop_sum = 0.0;
    for i in 0..policy_size {
        if policy_probs[i] >= 0.0 {
            alpha_distr[i] = (alpha_distr[i] - log_policy_mean).max(0.0);
            alpha_prop_sum += alpha_distr[i];
        }
    }
    let uniform_prob = 1.0 / legal_count as f64;
    for i in 0..policy_size {
        if policy_probs[i] >= 0.0 {
            alpha_distr[i] = if alpha_prop_sum <= 0.0 {
                uniform_prob
            } else {
                0.5 * (alpha_distr[i] / alpha_prop_sum + uniform_prob)
            };
        }
    }
}

/// Mix a Dirichlet draw into the policy in place.
pub fn add_dirichlet_noise(
    params: &SearchParams,
    rand: &mut Xoshiro256PlusPlus,
    policy_size: usize,
    policy_probs: &mut [f32],
) {
    let mut r = vec![0.0f64; policy_size];
    compute_dirichlet_alpha_distribution(policy_size, policy_probs, &mut r);

    let mut r_sum = 0.0;
    for i in 0..policy_size {
        if policy_probs[i] >= 0.0 {
            let alpha = r[i] * params.root_dirichlet_noise_total_concentration;
            // Gamma draws normalized across moves are a Dirichlet draw.
            let draw = if alpha <= 0.0 {
                0.0
            } else {
                Gamma::new(alpha, 1.0)
                    .map(|g| g.sample(rand))
                    .unwrap_or(0.0)
            };
            r[i] = draw;
            r_sum += draw;
        } else {
            r[i] = 0.0;
        }
    }
    if r_sum <= 0.0 {
        return;
    }
    for v in r.iter_mut() {
        *v /= r_sum;
    }

    let weight = params.root_dirichlet_noise_weight;
    for i in 0..policy_size {
        if policy_probs[i] >= 0.0 {
            policy_probs[i] =
                (r[i] * weight + policy_probs[i] as f64 * (1.0 - weight)) as f32;
        }
    }
}

impl Search {
    /// Build the noised/tempered root policy, if the configuration wants
    /// one and the output does not already carry it. Returns the
    /// replacement handle to install.
    pub fn maybe_add_policy_noise_and_temp(
        &self,
        thread: &mut SearchThread,
        is_root: bool,
        old_nn_output: &NnOutput,
    ) -> Option<Box<Arc<NnOutput>>> {
        let params = self.params();
        if !is_root {
            return None;
        }
        if !params.root_noise_enabled
            && params.root_policy_temperature == 1.0
            && params.root_policy_temperature_early == 1.0
            && self.root_hint_loc() == Loc::NULL
        {
            return None;
        }
        if old_nn_output.noised_policy_probs.is_some() {
            return None;
        }

        let policy_size = self.policy_size();
        let mut new_nn_output = old_nn_output.clone();
        let mut noised: Vec<f32> = old_nn_output.policy_probs.clone();

        if params.root_policy_temperature != 1.0 || params.root_policy_temperature_early != 1.0 {
            let root_policy_temperature = self.interpolate_early(
                params.chosen_move_temperature_halflife,
                params.root_policy_temperature_early,
                params.root_policy_temperature,
            );

            let max_value = noised[..policy_size]
                .iter()
                .fold(0.0f64, |m, &p| m.max(p as f64));
            assert!(max_value > 0.0);
            let log_max_value = max_value.ln();
            let inv_temp = 1.0 / root_policy_temperature;
            let mut sum = 0.0f64;
            // Log-space power keeps tiny probabilities from underflowing.
            for p in noised[..policy_size].iter_mut() {
                if *p > 0.0 {
                    let v = (((*p as f64).ln() - log_max_value) * inv_temp).exp();
                    *p = v as f32;
                    sum += v;
                }
            }
            assert!(sum > 0.0);
            for p in noised[..policy_size].iter_mut() {
                if *p >= 0.0 {
                    *p = (*p as f64 / sum) as f32;
                }
            }
        }

        if params.root_noise_enabled {
            add_dirichlet_noise(params, &mut thread.rand, policy_size, &mut noised);
        }

        // Shift a sliver of mass onto the hint move, comparable to what
        // noise would have given it.
        if self.root_hint_loc() != Loc::NULL {
            let prop_to_move = 0.02f64;
            let pos = self.get_pos(self.root_hint_loc());
            if noised[pos] >= 0.0 {
                let mut amount_to_move = 0.0f64;
                for p in noised[..policy_size].iter_mut() {
                    if *p >= 0.0 {
                        amount_to_move += *p as f64 * prop_to_move;
                        *p *= (1.0 - prop_to_move) as f32;
                    }
                }
                noised[pos] += amount_to_move as f32;
            }
        }

        new_nn_output.noised_policy_probs = Some(noised);
        Some(Box::new(Arc::new(new_nn_output)))
    }

    /// Sample an index proportional to `relative_probs^(1/temperature)`,
    /// computed stably in log space. Temperature near zero is argmax.
    pub fn choose_index_with_temperature(
        rand: &mut Xoshiro256PlusPlus,
        relative_probs: &[f64],
        temperature: f64,
    ) -> usize {
        assert!(!relative_probs.is_empty());
        let max_value = relative_probs.iter().fold(f64::MIN, |m, &v| m.max(v));
        assert!(max_value > 0.0);

        if temperature <= 1.0e-4 {
            let mut best_idx = 0;
            for (i, &v) in relative_probs.iter().enumerate() {
                if v > relative_probs[best_idx] {
                    best_idx = i;
                }
            }
            return best_idx;
        }

        let log_max = max_value.ln();
        let processed: Vec<f64> = relative_probs
            .iter()
            .map(|&v| {
                if v <= 0.0 {
                    0.0
                } else {
                    ((v.ln() - log_max) / temperature).exp()
                }
            })
            .collect();
        let sum: f64 = processed.iter().sum();
        assert!(sum > 0.0);
        let mut target = rand.gen_range(0.0..sum);
        for (i, &p) in processed.iter().enumerate() {
            if target < p {
                return i;
            }
            target -= p;
        }
        processed.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_alpha_distribution_sums_to_one() {
        let policy = vec![0.5f32, 0.3, 0.2, -1.0];
        let mut alpha = vec![0.0; 4];
        compute_dirichlet_alpha_distribution(4, &policy, &mut alpha);
        let sum: f64 = alpha[..3].iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(alpha[..3].iter().all(|&a| a > 0.0));
    }

    #[test]
    fn test_dirichlet_noise_preserves_normalization_and_legality() {
        let params = SearchParams::default();
        let mut rand = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut policy = vec![0.5f32, 0.3, 0.2, -1.0];
        add_dirichlet_noise(&params, &mut rand, 4, &mut policy);
        assert_eq!(policy[3], -1.0);
        let sum: f32 = policy[..3].iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_choose_index_temperature_zero_is_argmax() {
        let mut rand = Xoshiro256PlusPlus::seed_from_u64(3);
        let probs = vec![1.0, 5.0, 2.0];
        for _ in 0..10 {
            assert_eq!(Search::choose_index_with_temperature(&mut rand, &probs, 0.0), 1);
        }
    }

    #[test]
    fn test_choose_index_high_temperature_spreads() {
        let mut rand = Xoshiro256PlusPlus::seed_from_u64(3);
        let probs = vec![1.0, 5.0, 2.0];
        let mut counts = [0usize; 3];
        for _ in 0..2000 {
            counts[Search::choose_index_with_temperature(&mut rand, &probs, 1e9)] += 1;
        }
        // At extreme temperature the distribution is near uniform.
        for &c in &counts {
            assert!(c > 500, "counts {counts:?}");
        }
    }
}
