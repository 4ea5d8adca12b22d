//! Score-to-value numeric helpers.
//!
//! Scores are squashed smoothly into `[-1, 1]` so that a point of score
//! matters most near the dynamic center and tails off for blowouts. The
//! squash width scales with board size.

use crate::types::Player;

use super::{Board, BoardHistory};

/// Gauss-like 5-point quadrature offsets and weights used to average the
/// squash over the score distribution.
const QUAD_Z: [f64; 5] = [-2.0, -1.0, 0.0, 1.0, 2.0];
const QUAD_W: [f64; 5] = [0.054, 0.244, 0.404, 0.244, 0.054];

pub struct ScoreValue;

impl ScoreValue {
    /// Squash width for a board: `scale * sqrt(area)`.
    fn squash_width(scale: f64, board: &Board) -> f64 {
        let area = board.num_points() as f64;
        (scale * area.sqrt()).max(1e-10)
    }

    fn squash(score: f64, center: f64, width: f64) -> f64 {
        let x = (score - center) / width;
        (2.0 / std::f64::consts::PI) * x.atan()
    }

    /// Expected squashed score value for a normal-ish score distribution
    /// with the given mean and stdev.
    pub fn expected_white_score_value(
        score_mean: f64,
        score_stdev: f64,
        center: f64,
        scale: f64,
        board: &Board,
    ) -> f64 {
        let width = Self::squash_width(scale, board);
        if score_stdev <= 1e-10 {
            return Self::squash(score_mean, center, width);
        }
        let mut sum = 0.0;
        for (z, w) in QUAD_Z.iter().zip(QUAD_W.iter()) {
            sum += w * Self::squash(score_mean + z * score_stdev, center, width);
        }
        sum
    }

    /// d(score value)/d(score) at the mean, ignoring stdev effects.
    pub fn white_d_score_value_d_score(
        score_mean: f64,
        center: f64,
        scale: f64,
        board: &Board,
    ) -> f64 {
        let width = Self::squash_width(scale, board);
        let x = (score_mean - center) / width;
        (2.0 / std::f64::consts::PI) / (width * (1.0 + x * x))
    }

    /// Win fraction for white given the game winner; draws count as
    /// `draw_equivalent_wins_for_white`.
    pub fn white_wins_of_winner(winner: Option<Player>, draw_equivalent_wins_for_white: f64) -> f64 {
        match winner {
            Some(Player::White) => 1.0,
            Some(Player::Black) => 0.0,
            None => draw_equivalent_wins_for_white,
        }
    }

    /// Final-score adjustment for draws: exact ties lean toward the side
    /// favored by the draw equivalence.
    pub fn white_score_draw_adjust(
        score: f64,
        draw_equivalent_wins_for_white: f64,
        _hist: &BoardHistory,
    ) -> f64 {
        if score == 0.0 {
            draw_equivalent_wins_for_white - 0.5
        } else {
            score
        }
    }

    /// Second moment of the final score, treating it as a point mass on the
    /// (draw-adjusted) outcome.
    pub fn white_score_mean_sq_of_score_gridded(
        score: f64,
        draw_equivalent_wins_for_white: f64,
    ) -> f64 {
        let s = if score == 0.0 {
            draw_equivalent_wins_for_white - 0.5
        } else {
            score
        };
        s * s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_value_monotone_and_bounded() {
        let board = Board::new(9, 9);
        let mut prev = -2.0;
        for i in -60..=60 {
            let v = ScoreValue::expected_white_score_value(i as f64, 0.0, 0.0, 2.0, &board);
            assert!(v > prev);
            assert!(v > -1.0 && v < 1.0);
            prev = v;
        }
        assert_eq!(
            ScoreValue::expected_white_score_value(0.0, 0.0, 0.0, 2.0, &board),
            0.0
        );
    }

    #[test]
    fn test_stdev_pulls_value_toward_zero() {
        let board = Board::new(9, 9);
        let sharp = ScoreValue::expected_white_score_value(20.0, 0.0, 0.0, 2.0, &board);
        let fuzzy = ScoreValue::expected_white_score_value(20.0, 15.0, 0.0, 2.0, &board);
        assert!(fuzzy < sharp);
        assert!(fuzzy > 0.0);
    }

    #[test]
    fn test_derivative_positive_and_peaks_at_center() {
        let board = Board::new(9, 9);
        let at_center = ScoreValue::white_d_score_value_d_score(5.0, 5.0, 2.0, &board);
        let off_center = ScoreValue::white_d_score_value_d_score(25.0, 5.0, 2.0, &board);
        assert!(at_center > off_center);
        assert!(off_center > 0.0);
    }

    #[test]
    fn test_winner_values() {
        assert_eq!(ScoreValue::white_wins_of_winner(Some(Player::White), 0.5), 1.0);
        assert_eq!(ScoreValue::white_wins_of_winner(Some(Player::Black), 0.5), 0.0);
        assert_eq!(ScoreValue::white_wins_of_winner(None, 0.3), 0.3);
    }
}
