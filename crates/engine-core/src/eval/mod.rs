//! Neural evaluator interface.
//!
//! The search never sees a network directly; it talks to an [`NnEvaluator`]
//! that fills an [`NnResultBuf`] with a shared, immutable [`NnOutput`].
//! Deterministic test evaluators live here too so scenario tests and benches
//! do not need a real network.

use std::sync::Arc;
use std::time::Duration;

use crate::board::{Board, BoardHistory};
use crate::types::{Hash128, Loc, NnPos, Player};

/// Extra evaluation inputs that change what the net is asked to judge.
#[derive(Debug, Clone, Copy)]
pub struct NnInputParams {
    pub draw_equivalent_wins_for_white: f64,
    pub conservative_pass: bool,
    pub nn_policy_temperature: f64,
    pub avoid_dagger_hack: bool,
    /// Signed per side: positive favors the side to move.
    pub playout_doubling_advantage: f64,
    pub symmetry: usize,
}

impl Default for NnInputParams {
    fn default() -> NnInputParams {
        NnInputParams {
            draw_equivalent_wins_for_white: 0.5,
            conservative_pass: false,
            nn_policy_temperature: 1.0,
            avoid_dagger_hack: false,
            playout_doubling_advantage: 0.0,
            symmetry: 0,
        }
    }
}

/// One evaluation result. Value-bearing fields are immutable once shared;
/// the noised-policy extension is added by replacing the whole handle.
#[derive(Debug, Clone)]
pub struct NnOutput {
    /// Per-policy-position prior. Negative means illegal.
    pub policy_probs: Vec<f32>,
    pub white_win_prob: f32,
    pub white_loss_prob: f32,
    pub white_no_result_prob: f32,
    pub white_score_mean: f32,
    pub white_score_mean_sq: f32,
    pub white_lead: f32,
    pub white_owner_map: Option<Vec<f32>>,
    pub shortterm_winloss_error: f32,
    pub shortterm_score_error: f32,
    pub nn_hash: Hash128,
    /// Root-only noised/tempered copy of the policy, when installed.
    pub noised_policy_probs: Option<Vec<f32>>,
}

impl NnOutput {
    #[inline]
    pub fn policy_probs_maybe_noised(&self) -> &[f32] {
        match &self.noised_policy_probs {
            Some(p) => p,
            None => &self.policy_probs,
        }
    }

    /// Average several outputs (used for symmetry sampling at the root).
    pub fn average(outputs: &[Arc<NnOutput>]) -> NnOutput {
        assert!(!outputs.is_empty());
        let n = outputs.len() as f32;
        let mut out = (*outputs[0]).clone();
        out.noised_policy_probs = None;
        for other in &outputs[1..] {
            for (a, b) in out.policy_probs.iter_mut().zip(other.policy_probs.iter()) {
                if *a >= 0.0 && *b >= 0.0 {
                    *a += *b;
                }
            }
            out.white_win_prob += other.white_win_prob;
            out.white_loss_prob += other.white_loss_prob;
            out.white_no_result_prob += other.white_no_result_prob;
            out.white_score_mean += other.white_score_mean;
            out.white_score_mean_sq += other.white_score_mean_sq;
            out.white_lead += other.white_lead;
            out.shortterm_winloss_error += other.shortterm_winloss_error;
            out.shortterm_score_error += other.shortterm_score_error;
            if let (Some(a), Some(b)) = (out.white_owner_map.as_mut(), other.white_owner_map.as_ref())
            {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    *x += *y;
                }
            }
        }
        for p in out.policy_probs.iter_mut() {
            if *p >= 0.0 {
                *p /= n;
            }
        }
        out.white_win_prob /= n;
        out.white_loss_prob /= n;
        out.white_no_result_prob /= n;
        out.white_score_mean /= n;
        out.white_score_mean_sq /= n;
        out.white_lead /= n;
        out.shortterm_winloss_error /= n;
        out.shortterm_score_error /= n;
        if let Some(m) = out.white_owner_map.as_mut() {
            for x in m.iter_mut() {
                *x /= n;
            }
        }
        out
    }
}

/// Result slot filled by an evaluator call.
#[derive(Default)]
pub struct NnResultBuf {
    pub result: Option<Arc<NnOutput>>,
}

pub trait NnEvaluator: Send + Sync {
    fn nn_x_len(&self) -> usize;
    fn nn_y_len(&self) -> usize;

    fn evaluate(
        &self,
        board: &Board,
        history: &BoardHistory,
        next_pla: Player,
        params: &NnInputParams,
        buf: &mut NnResultBuf,
        skip_cache: bool,
        include_owner_map: bool,
    );

    /// Whether shortterm error estimates are meaningful.
    fn supports_shortterm_error(&self) -> bool {
        false
    }

    /// Pacing stall used when evaluating terminal leaves, so a thread cannot
    /// race far ahead of threads blocked on a device batch.
    fn wait_for_next_nn_eval_if_any(&self) {}
}

/// Deterministic evaluator for tests and benches: uniform policy over legal
/// moves, values derived from the position hash so results are reproducible
/// but position-dependent.
pub struct UniformEvaluator {
    nn_x_len: usize,
    nn_y_len: usize,
    /// Spread of the pseudo-random winrate around 0.5.
    pub value_spread: f32,
}

impl UniformEvaluator {
    pub fn new(nn_x_len: usize, nn_y_len: usize) -> UniformEvaluator {
        UniformEvaluator {
            nn_x_len,
            nn_y_len,
            value_spread: 0.2,
        }
    }
}

impl NnEvaluator for UniformEvaluator {
    fn nn_x_len(&self) -> usize {
        self.nn_x_len
    }
    fn nn_y_len(&self) -> usize {
        self.nn_y_len
    }

    fn evaluate(
        &self,
        board: &Board,
        history: &BoardHistory,
        next_pla: Player,
        params: &NnInputParams,
        buf: &mut NnResultBuf,
        _skip_cache: bool,
        include_owner_map: bool,
    ) {
        let policy_size = NnPos::policy_size(self.nn_x_len, self.nn_y_len);
        let mut policy = vec![-1.0f32; policy_size];
        let mut num_legal = 0usize;
        for pos in 0..policy_size {
            let loc = NnPos::pos_to_loc(pos, board.x_size, board.y_size, self.nn_x_len, self.nn_y_len);
            if loc == Loc::NULL {
                continue;
            }
            if history.is_legal(board, loc, next_pla) {
                policy[pos] = 0.0;
                num_legal += 1;
            }
        }
        let p = 1.0 / num_legal.max(1) as f32;
        for v in policy.iter_mut() {
            if *v >= 0.0 {
                *v = p;
            }
        }

        let state = history.state_hash(next_pla, params.draw_equivalent_wins_for_white);
        // A cheap deterministic pseudo-value in (0,1).
        let unit = (state.hash0 >> 11) as f32 / (1u64 << 53) as f32;
        let win = (0.5 + self.value_spread * (unit - 0.5)).clamp(0.01, 0.99);
        let score_mean = (unit - 0.5) * 4.0;

        buf.result = Some(Arc::new(NnOutput {
            policy_probs: policy,
            white_win_prob: win,
            white_loss_prob: 1.0 - win,
            white_no_result_prob: 0.0,
            white_score_mean: score_mean,
            white_score_mean_sq: score_mean * score_mean + 1.0,
            white_lead: score_mean,
            white_owner_map: if include_owner_map {
                Some(vec![0.0; self.nn_x_len * self.nn_y_len])
            } else {
                None
            },
            shortterm_winloss_error: 0.0,
            shortterm_score_error: 0.0,
            nn_hash: state.mix(0x6e6e5f68617368),
            noised_policy_probs: None,
        }));
    }
}

/// Wraps an evaluator and sleeps on every call, for exercising virtual-loss
/// dispersion under slow device conditions.
pub struct SlowEvaluator<E> {
    pub inner: E,
    pub delay: Duration,
}

impl<E: NnEvaluator> SlowEvaluator<E> {
    pub fn new(inner: E, delay: Duration) -> SlowEvaluator<E> {
        SlowEvaluator { inner, delay }
    }
}

impl<E: NnEvaluator> NnEvaluator for SlowEvaluator<E> {
    fn nn_x_len(&self) -> usize {
        self.inner.nn_x_len()
    }
    fn nn_y_len(&self) -> usize {
        self.inner.nn_y_len()
    }

    fn evaluate(
        &self,
        board: &Board,
        history: &BoardHistory,
        next_pla: Player,
        params: &NnInputParams,
        buf: &mut NnResultBuf,
        skip_cache: bool,
        include_owner_map: bool,
    ) {
        std::thread::sleep(self.delay);
        self.inner
            .evaluate(board, history, next_pla, params, buf, skip_cache, include_owner_map);
    }

    fn supports_shortterm_error(&self) -> bool {
        self.inner.supports_shortterm_error()
    }

    fn wait_for_next_nn_eval_if_any(&self) {
        std::thread::sleep(self.delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Rules;

    #[test]
    fn test_uniform_evaluator_policy_sums_to_one() {
        let board = Board::new(5, 5);
        let hist = BoardHistory::new(&board, Player::Black, Rules::default(), 0);
        let eval = UniformEvaluator::new(5, 5);
        let mut buf = NnResultBuf::default();
        eval.evaluate(
            &board,
            &hist,
            Player::Black,
            &NnInputParams::default(),
            &mut buf,
            false,
            false,
        );
        let out = buf.result.unwrap();
        let sum: f32 = out.policy_probs.iter().filter(|p| **p >= 0.0).sum();
        assert!((sum - 1.0).abs() < 1e-4);
        // 25 board moves + pass are all legal.
        let legal = out.policy_probs.iter().filter(|p| **p >= 0.0).count();
        assert_eq!(legal, 26);
    }

    #[test]
    fn test_uniform_evaluator_deterministic() {
        let board = Board::new(5, 5);
        let hist = BoardHistory::new(&board, Player::Black, Rules::default(), 0);
        let eval = UniformEvaluator::new(5, 5);
        let mut buf1 = NnResultBuf::default();
        let mut buf2 = NnResultBuf::default();
        let params = NnInputParams::default();
        eval.evaluate(&board, &hist, Player::Black, &params, &mut buf1, false, false);
        eval.evaluate(&board, &hist, Player::Black, &params, &mut buf2, false, false);
        assert_eq!(
            buf1.result.unwrap().white_win_prob,
            buf2.result.unwrap().white_win_prob
        );
    }

    #[test]
    fn test_average_outputs() {
        let a = Arc::new(NnOutput {
            policy_probs: vec![0.6, 0.4, -1.0],
            white_win_prob: 0.8,
            white_loss_prob: 0.2,
            white_no_result_prob: 0.0,
            white_score_mean: 4.0,
            white_score_mean_sq: 17.0,
            white_lead: 4.0,
            white_owner_map: None,
            shortterm_winloss_error: 0.0,
            shortterm_score_error: 0.0,
            nn_hash: Hash128::ZERO,
            noised_policy_probs: None,
        });
        let mut b = (*a).clone();
        b.white_win_prob = 0.4;
        b.white_loss_prob = 0.6;
        let avg = NnOutput::average(&[a, Arc::new(b)]);
        assert!((avg.white_win_prob - 0.6).abs() < 1e-6);
        assert!((avg.policy_probs[0] - 0.6).abs() < 1e-6);
        assert_eq!(avg.policy_probs[2], -1.0);
    }
}
