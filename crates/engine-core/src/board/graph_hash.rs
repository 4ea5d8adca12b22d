//! Graph-search node identity hashes.
//!
//! Identity is a function of the game state (position, side to move, phase,
//! pass count, scoring-relevant parameters) rather than the path that
//! reached it, so that transposing move orders share a node. The repetition
//! bound is folded in as salt so searches configured differently never share
//! entries.

use crate::types::{Hash128, Player};

use super::BoardHistory;

pub struct GraphHash;

impl GraphHash {
    /// Hash for the current state of `history`.
    pub fn from_scratch(
        history: &BoardHistory,
        next_pla: Player,
        rep_bound: i32,
        draw_equivalent_wins_for_white: f64,
    ) -> Hash128 {
        history
            .state_hash(next_pla, draw_equivalent_wins_for_white)
            .mix(rep_bound as u64)
    }

    /// Hash after a move was just applied to `history`. Defined to agree
    /// with [`GraphHash::from_scratch`] on the resulting state, which is
    /// what makes transpositions collide; the previous hash parameter
    /// exists for call sites that extend incrementally.
    pub fn extend(
        _prev: Hash128,
        history: &BoardHistory,
        next_pla: Player,
        rep_bound: i32,
        draw_equivalent_wins_for_white: f64,
    ) -> Hash128 {
        Self::from_scratch(history, next_pla, rep_bound, draw_equivalent_wins_for_white)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Board, Rules};
    use crate::types::Loc;

    #[test]
    fn test_extend_agrees_with_from_scratch() {
        let mut board = Board::new(5, 5);
        let mut hist = BoardHistory::new(&board, Player::Black, Rules::default(), 0);
        let h0 = GraphHash::from_scratch(&hist, Player::Black, 50, 0.5);
        hist.make_board_move_assume_legal(&mut board, Loc::from_xy(2, 2, 5), Player::Black, false);
        let extended = GraphHash::extend(h0, &hist, Player::White, 50, 0.5);
        let scratch = GraphHash::from_scratch(&hist, Player::White, 50, 0.5);
        assert_eq!(extended, scratch);
        assert_ne!(extended, h0);
    }

    #[test]
    fn test_rep_bound_salts_hash() {
        let board = Board::new(5, 5);
        let hist = BoardHistory::new(&board, Player::Black, Rules::default(), 0);
        assert_ne!(
            GraphHash::from_scratch(&hist, Player::Black, 10, 0.5),
            GraphHash::from_scratch(&hist, Player::Black, 50, 0.5)
        );
    }
}
