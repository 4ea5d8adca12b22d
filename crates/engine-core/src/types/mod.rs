//! Core vocabulary types shared by the board model and the search.

mod hash;
mod loc;

pub use hash::Hash128;
pub use loc::Loc;

use serde::{Deserialize, Serialize};

/// A player, black or white.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Player {
    Black = 1,
    White = 2,
}

impl Player {
    #[inline]
    pub fn opp(self) -> Player {
        match self {
            Player::Black => Player::White,
            Player::White => Player::Black,
        }
    }

    /// +1 for white, -1 for black. Search utilities are white-positive.
    #[inline]
    pub fn white_sign(self) -> f64 {
        match self {
            Player::Black => -1.0,
            Player::White => 1.0,
        }
    }
}

/// The contents of a board point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Color {
    Empty = 0,
    Black = 1,
    White = 2,
}

impl Color {
    #[inline]
    pub fn of(pla: Player) -> Color {
        match pla {
            Player::Black => Color::Black,
            Player::White => Color::White,
        }
    }

    #[inline]
    pub fn player(self) -> Option<Player> {
        match self {
            Color::Empty => None,
            Color::Black => Some(Player::Black),
            Color::White => Some(Player::White),
        }
    }
}

/// Helpers for converting between board locations and neural-net policy
/// positions. The policy array is row-major over the nn-sized board plus a
/// trailing entry for pass.
pub struct NnPos;

impl NnPos {
    pub const MAX_BOARD_LEN: usize = 19;
    pub const MAX_POLICY_SIZE: usize = Self::MAX_BOARD_LEN * Self::MAX_BOARD_LEN + 1;

    #[inline]
    pub fn policy_size(nn_x_len: usize, nn_y_len: usize) -> usize {
        nn_x_len * nn_y_len + 1
    }

    #[inline]
    pub fn loc_to_pos(loc: Loc, x_size: usize, nn_x_len: usize, nn_y_len: usize) -> usize {
        if loc == Loc::PASS {
            return nn_x_len * nn_y_len;
        }
        let (x, y) = loc.xy(x_size);
        y * nn_x_len + x
    }

    /// Returns `Loc::NULL` for positions that fall outside the actual board.
    #[inline]
    pub fn pos_to_loc(
        pos: usize,
        x_size: usize,
        y_size: usize,
        nn_x_len: usize,
        nn_y_len: usize,
    ) -> Loc {
        if pos == nn_x_len * nn_y_len {
            return Loc::PASS;
        }
        let x = pos % nn_x_len;
        let y = pos / nn_x_len;
        if x >= x_size || y >= y_size {
            return Loc::NULL;
        }
        Loc::from_xy(x, y, x_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_opp() {
        assert_eq!(Player::Black.opp(), Player::White);
        assert_eq!(Player::White.opp(), Player::Black);
        assert_eq!(Player::White.white_sign(), 1.0);
        assert_eq!(Player::Black.white_sign(), -1.0);
    }

    #[test]
    fn test_pos_loc_roundtrip() {
        let (xs, ys) = (9, 9);
        let (nx, ny) = (9, 9);
        for y in 0..ys {
            for x in 0..xs {
                let loc = Loc::from_xy(x, y, xs);
                let pos = NnPos::loc_to_pos(loc, xs, nx, ny);
                assert_eq!(NnPos::pos_to_loc(pos, xs, ys, nx, ny), loc);
            }
        }
        let pass_pos = NnPos::loc_to_pos(Loc::PASS, xs, nx, ny);
        assert_eq!(pass_pos, nx * ny);
        assert_eq!(NnPos::pos_to_loc(pass_pos, xs, ys, nx, ny), Loc::PASS);
    }

    #[test]
    fn test_pos_outside_board_is_null() {
        // 9x9 board evaluated by a 19x19 net: positions past the board edge
        // decode to NULL.
        let loc = NnPos::pos_to_loc(15, 9, 9, 19, 19);
        assert_eq!(loc, Loc::NULL);
    }
}
