//! Pattern-bonus table: utility shifts keyed on (player, move, local board)
//! fingerprints. Bonuses perturb utilities without perturbing priors; the
//! main client is repeated-pattern avoidance across a game.

use std::collections::HashMap;

use crate::board::BoardHistory;
use crate::types::{Hash128, Loc, Player};

#[derive(Debug, Clone, Copy, Default)]
pub struct PatternBonusEntry {
    pub utility_bonus: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PatternBonusTable {
    entries: HashMap<Hash128, PatternBonusEntry>,
}

impl PatternBonusTable {
    pub fn new() -> PatternBonusTable {
        PatternBonusTable::default()
    }

    /// Fingerprint of `pla` playing `loc` on the given board.
    pub fn get_hash(pla: Player, loc: Loc, board: &crate::board::Board) -> Hash128 {
        if loc == Loc::NULL {
            return Hash128::ZERO;
        }
        board
            .local_pattern_hash(loc, 3)
            .mix(pla as u64)
            .mix(loc.0 as u64)
    }

    pub fn get(&self, hash: Hash128) -> PatternBonusEntry {
        self.entries.get(&hash).copied().unwrap_or_default()
    }

    pub fn add_bonus(&mut self, hash: Hash128, utility_bonus: f64) {
        if hash == Hash128::ZERO {
            return;
        }
        self.entries.entry(hash).or_default().utility_bonus += utility_bonus;
    }

    /// Install a bonus on every move `pla` already made this game, so the
    /// search is nudged away from repeating its own patterns.
    pub fn add_bonus_for_game_moves(&mut self, history: &BoardHistory, bonus: f64, pla: Player) {
        let num_moves = history.move_history.len();
        for (i, m) in history.move_history.iter().enumerate() {
            if m.pla != pla || m.loc == Loc::PASS {
                continue;
            }
            // The board as it was just before this move was played.
            let moves_ago = num_moves - i;
            let board = history.get_recent_board(moves_ago);
            let hash = Self::get_hash(m.pla, m.loc, board);
            self.add_bonus(hash, bonus);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Board, Rules};

    #[test]
    fn test_bonus_accumulates() {
        let board = Board::new(5, 5);
        let mut table = PatternBonusTable::new();
        let hash = PatternBonusTable::get_hash(Player::Black, Loc(7), &board);
        assert_eq!(table.get(hash).utility_bonus, 0.0);
        table.add_bonus(hash, -0.1);
        table.add_bonus(hash, -0.1);
        assert!((table.get(hash).utility_bonus + 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_game_moves_install_bonuses() {
        let mut board = Board::new(5, 5);
        let mut hist = BoardHistory::new(&board, Player::Black, Rules::default(), 0);
        hist.make_board_move_assume_legal(&mut board, Loc::from_xy(1, 1, 5), Player::Black, false);
        hist.make_board_move_assume_legal(&mut board, Loc::from_xy(3, 3, 5), Player::White, false);
        hist.make_board_move_assume_legal(&mut board, Loc::from_xy(2, 2, 5), Player::Black, false);

        let mut table = PatternBonusTable::new();
        table.add_bonus_for_game_moves(&hist, -0.05, Player::Black);
        assert_eq!(table.len(), 2);

        let mut none = PatternBonusTable::new();
        none.add_bonus_for_game_moves(&hist, -0.05, Player::White);
        assert_eq!(none.len(), 1);
    }
}
