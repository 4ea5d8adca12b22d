//! Board history: move record, phase and game-over tracking, handicap
//! accounting, and recent-board access for local-pattern keys.

use std::collections::VecDeque;

use crate::types::{Hash128, Loc, Player};

use super::{Board, HandicapBonusRule, Rules, ScoringRule};

/// How many recent board snapshots are retained for pattern keys.
const NUM_RECENT_BOARDS: usize = 8;

/// Games longer than `points * LONG_CYCLE_FACTOR + LONG_CYCLE_SLACK` moves
/// are declared no-result (a stand-in for long-cycle rules).
const LONG_CYCLE_FACTOR: usize = 3;
const LONG_CYCLE_SLACK: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub loc: Loc,
    pub pla: Player,
}

#[derive(Debug, Clone)]
pub struct BoardHistory {
    pub rules: Rules,
    pub move_history: Vec<Move>,
    /// Turn number of the first recorded position (nonzero when the game
    /// was loaded mid-way).
    pub initial_turn_number: i64,
    /// 0 in the main phase; territory scoring passes through phases 1 and 2.
    pub encore_phase: i32,
    pub is_game_finished: bool,
    pub is_no_result: bool,
    pub winner: Option<Player>,
    pub final_white_minus_black_score: f64,
    pub white_handicap_bonus_score: f32,
    pub assume_multiple_starting_black_moves_are_handicap: bool,
    consecutive_passes: i32,
    recent_boards: VecDeque<Board>,
}

impl BoardHistory {
    pub fn new(board: &Board, _pla: Player, rules: Rules, encore_phase: i32) -> BoardHistory {
        let mut recent_boards = VecDeque::with_capacity(NUM_RECENT_BOARDS + 1);
        recent_boards.push_front(board.clone());
        BoardHistory {
            rules,
            move_history: Vec::new(),
            initial_turn_number: 0,
            encore_phase,
            is_game_finished: false,
            is_no_result: false,
            winner: None,
            final_white_minus_black_score: 0.0,
            white_handicap_bonus_score: 0.0,
            assume_multiple_starting_black_moves_are_handicap: true,
            consecutive_passes: 0,
            recent_boards,
        }
    }

    pub fn clear(&mut self, board: &Board, pla: Player, rules: Rules, encore_phase: i32) {
        let assume = self.assume_multiple_starting_black_moves_are_handicap;
        *self = BoardHistory::new(board, pla, rules, encore_phase);
        self.assume_multiple_starting_black_moves_are_handicap = assume;
    }

    pub fn set_komi(&mut self, komi: f32) {
        self.rules.komi = komi;
    }

    pub fn set_assume_multiple_starting_black_moves_are_handicap(&mut self, b: bool) {
        self.assume_multiple_starting_black_moves_are_handicap = b;
    }

    /// The board as it was `moves_ago` moves ago; 0 is the current board.
    /// Clamped to the oldest retained snapshot.
    pub fn get_recent_board(&self, moves_ago: usize) -> &Board {
        let idx = moves_ago.min(self.recent_boards.len() - 1);
        &self.recent_boards[idx]
    }

    /// Strict legality for the player whose turn the history believes it is.
    pub fn is_legal(&self, board: &Board, loc: Loc, pla: Player) -> bool {
        board.is_legal(loc, pla, self.rules.multi_stone_suicide_legal)
    }

    /// Tolerant legality: accepts externally-driven move sequences where the
    /// same player moves twice in a row, by ignoring the ko point that only
    /// binds the on-turn player.
    pub fn is_legal_tolerant(&self, board: &Board, loc: Loc, pla: Player) -> bool {
        let multi_stone_suicide_legal = true;
        if loc != Loc::PASS && loc == board.ko_loc {
            let mut copy = board.clone();
            copy.clear_simple_ko_loc();
            return copy.is_legal(loc, pla, multi_stone_suicide_legal);
        }
        board.is_legal(loc, pla, multi_stone_suicide_legal)
    }

    /// Whether a pass right now by `_pla` would end the game.
    pub fn pass_would_end_game(&self, _board: &Board, _pla: Player) -> bool {
        if self.is_game_finished {
            return false;
        }
        let ends_on_two_passes = match self.rules.scoring_rule {
            ScoringRule::Area => true,
            ScoringRule::Territory => self.encore_phase >= 2,
        };
        ends_on_two_passes && self.consecutive_passes >= 1
    }

    /// Whether a pass right now would end the current phase (without
    /// necessarily ending the game).
    pub fn pass_would_end_phase(&self, _board: &Board, _pla: Player) -> bool {
        if self.is_game_finished {
            return false;
        }
        self.consecutive_passes >= 1
    }

    /// Number of handicap stones inferred from leading black moves.
    pub fn compute_num_handicap_stones(&self) -> i32 {
        if !self.assume_multiple_starting_black_moves_are_handicap {
            return 0;
        }
        let mut count = 0;
        for m in &self.move_history {
            match m.pla {
                Player::Black if m.loc != Loc::PASS => count += 1,
                Player::Black => break,
                Player::White => break,
            }
        }
        if count >= 2 {
            count
        } else {
            0
        }
    }

    fn recompute_white_handicap_bonus(&mut self) {
        let n = self.compute_num_handicap_stones();
        self.white_handicap_bonus_score = match self.rules.white_handicap_bonus_rule {
            HandicapBonusRule::None => 0.0,
            HandicapBonusRule::N => n as f32,
            HandicapBonusRule::NMinusOne => {
                if n > 0 {
                    (n - 1) as f32
                } else {
                    0.0
                }
            }
        };
    }

    /// Play a move assumed legal, updating the board, history, phase, and
    /// game-over state. `prevent_encore` suppresses a phase transition that
    /// this move's pass would otherwise trigger.
    pub fn make_board_move_assume_legal(
        &mut self,
        board: &mut Board,
        loc: Loc,
        pla: Player,
        prevent_encore: bool,
    ) {
        board.play_move_assume_legal(loc, pla);
        self.move_history.push(Move { loc, pla });
        self.recent_boards.push_front(board.clone());
        while self.recent_boards.len() > NUM_RECENT_BOARDS {
            self.recent_boards.pop_back();
        }
        self.recompute_white_handicap_bonus();

        if loc == Loc::PASS {
            self.consecutive_passes += 1;
        } else {
            self.consecutive_passes = 0;
        }

        if self.move_history.len() > board.num_points() * LONG_CYCLE_FACTOR + LONG_CYCLE_SLACK {
            self.is_game_finished = true;
            self.is_no_result = true;
            return;
        }

        if self.consecutive_passes >= 2 {
            match self.rules.scoring_rule {
                ScoringRule::Area => self.finish_game(board),
                ScoringRule::Territory => {
                    if self.encore_phase >= 2 {
                        self.finish_game(board);
                    } else if !prevent_encore {
                        self.encore_phase += 1;
                        self.consecutive_passes = 0;
                    }
                }
            }
        }
    }

    fn finish_game(&mut self, board: &Board) {
        let score = board.area_score_white_minus_black()
            + self.rules.komi as f64
            + self.white_handicap_bonus_score as f64;
        self.is_game_finished = true;
        self.final_white_minus_black_score = score;
        self.winner = if score > 0.0 {
            Some(Player::White)
        } else if score < 0.0 {
            Some(Player::Black)
        } else {
            None
        };
    }

    /// Hash of the current game state (not the path to it), for graph-search
    /// node identity.
    pub fn state_hash(&self, next_pla: Player, draw_equivalent_wins_for_white: f64) -> Hash128 {
        let board = self.get_recent_board(0);
        board
            .pos_hash
            .mix(next_pla as u64)
            .mix(self.encore_phase as u64)
            .mix(self.consecutive_passes as u64)
            .mix((self.rules.komi * 2.0) as i64 as u64)
            .mix((draw_equivalent_wins_for_white * 65536.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Board, BoardHistory) {
        let board = Board::new(5, 5);
        let hist = BoardHistory::new(&board, Player::Black, Rules::default(), 0);
        (board, hist)
    }

    #[test]
    fn test_two_passes_end_area_game() {
        let (mut board, mut hist) = setup();
        hist.make_board_move_assume_legal(&mut board, Loc::PASS, Player::Black, false);
        assert!(!hist.is_game_finished);
        assert!(hist.pass_would_end_game(&board, Player::White));
        hist.make_board_move_assume_legal(&mut board, Loc::PASS, Player::White, false);
        assert!(hist.is_game_finished);
        // Empty board: komi decides for white.
        assert_eq!(hist.winner, Some(Player::White));
        assert_eq!(hist.final_white_minus_black_score, 7.5);
    }

    #[test]
    fn test_territory_passes_advance_encore() {
        let board0 = Board::new(5, 5);
        let mut rules = Rules::default();
        rules.scoring_rule = ScoringRule::Territory;
        let mut hist = BoardHistory::new(&board0, Player::Black, rules, 0);
        let mut board = board0;
        for _ in 0..2 {
            hist.make_board_move_assume_legal(&mut board, Loc::PASS, Player::Black, false);
            hist.make_board_move_assume_legal(&mut board, Loc::PASS, Player::White, false);
        }
        assert_eq!(hist.encore_phase, 2);
        assert!(!hist.is_game_finished);
        hist.make_board_move_assume_legal(&mut board, Loc::PASS, Player::Black, false);
        hist.make_board_move_assume_legal(&mut board, Loc::PASS, Player::White, false);
        assert!(hist.is_game_finished);
    }

    #[test]
    fn test_prevent_encore_suppresses_phase_change() {
        let board0 = Board::new(5, 5);
        let mut rules = Rules::default();
        rules.scoring_rule = ScoringRule::Territory;
        let mut hist = BoardHistory::new(&board0, Player::Black, rules, 0);
        let mut board = board0;
        hist.make_board_move_assume_legal(&mut board, Loc::PASS, Player::Black, false);
        hist.make_board_move_assume_legal(&mut board, Loc::PASS, Player::White, true);
        assert_eq!(hist.encore_phase, 0);
    }

    #[test]
    fn test_handicap_stones_inferred() {
        let (mut board, mut hist) = setup();
        hist.make_board_move_assume_legal(&mut board, Loc::from_xy(2, 2, 5), Player::Black, false);
        hist.make_board_move_assume_legal(&mut board, Loc::from_xy(1, 1, 5), Player::Black, false);
        hist.make_board_move_assume_legal(&mut board, Loc::from_xy(3, 3, 5), Player::White, false);
        assert_eq!(hist.compute_num_handicap_stones(), 2);
        hist.set_assume_multiple_starting_black_moves_are_handicap(false);
        assert_eq!(hist.compute_num_handicap_stones(), 0);
    }

    #[test]
    fn test_recent_boards() {
        let (mut board, mut hist) = setup();
        let h0 = board.pos_hash;
        hist.make_board_move_assume_legal(&mut board, Loc::from_xy(2, 2, 5), Player::Black, false);
        assert_eq!(hist.get_recent_board(0).pos_hash, board.pos_hash);
        assert_eq!(hist.get_recent_board(1).pos_hash, h0);
        // Clamped past the start.
        assert_eq!(hist.get_recent_board(7).pos_hash, h0);
    }

    #[test]
    fn test_state_hash_transposes() {
        let (mut b1, mut h1) = setup();
        let (mut b2, mut h2) = setup();
        let a = Loc::from_xy(1, 1, 5);
        let b = Loc::from_xy(3, 3, 5);
        h1.make_board_move_assume_legal(&mut b1, a, Player::Black, false);
        h1.make_board_move_assume_legal(&mut b1, b, Player::White, false);
        h2.make_board_move_assume_legal(&mut b2, b, Player::White, false);
        h2.make_board_move_assume_legal(&mut b2, a, Player::Black, false);
        assert_eq!(
            h1.state_hash(Player::Black, 0.5),
            h2.state_hash(Player::Black, 0.5)
        );
    }
}
