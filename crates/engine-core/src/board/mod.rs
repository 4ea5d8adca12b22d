//! Go board model: stones, captures, ko, legality, zobrist hashing,
//! area computation, and board symmetries.
//!
//! The board is deliberately simple; the search core only needs correct
//! rules plumbing, not a fast one.

mod graph_hash;
mod history;
mod rules;
mod score_value;
mod zobrist;

pub use graph_hash::GraphHash;
pub use history::{BoardHistory, Move};
pub use rules::{HandicapBonusRule, Rules, ScoringRule};
pub use score_value::ScoreValue;

use crate::types::{Color, Hash128, Loc, Player};
use smallvec::SmallVec;

pub const MAX_BOARD_LEN: usize = 19;
pub const MAX_ARR_SIZE: usize = MAX_BOARD_LEN * MAX_BOARD_LEN;

/// Board symmetries: bit 0 = flip x, bit 1 = flip y, bit 2 = transpose.
pub const NUM_SYMMETRIES: usize = 8;

#[derive(Debug, Clone)]
pub struct Board {
    pub x_size: usize,
    pub y_size: usize,
    colors: Vec<Color>,
    /// Simple-ko point, illegal for the player to move.
    pub ko_loc: Loc,
    /// Incrementally maintained zobrist hash of the stones plus ko point.
    pub pos_hash: Hash128,
    /// Stones captured from each player: [black captured, white captured].
    pub num_captured: [u32; 2],
}

impl Board {
    pub fn new(x_size: usize, y_size: usize) -> Board {
        assert!(x_size >= 2 && x_size <= MAX_BOARD_LEN);
        assert!(y_size >= 2 && y_size <= MAX_BOARD_LEN);
        Board {
            x_size,
            y_size,
            colors: vec![Color::Empty; x_size * y_size],
            ko_loc: Loc::NULL,
            pos_hash: zobrist::size_hash(x_size, y_size),
            num_captured: [0, 0],
        }
    }

    #[inline]
    pub fn num_points(&self) -> usize {
        self.x_size * self.y_size
    }

    #[inline]
    pub fn color(&self, loc: Loc) -> Color {
        self.colors[loc.index()]
    }

    #[inline]
    pub fn is_on_board(&self, loc: Loc) -> bool {
        loc.is_on_board() && loc.index() < self.colors.len()
    }

    pub fn clear_simple_ko_loc(&mut self) {
        if self.ko_loc != Loc::NULL {
            self.pos_hash ^= zobrist::ko_hash(self.ko_loc);
            self.ko_loc = Loc::NULL;
        }
    }

    fn neighbors(&self, loc: Loc) -> SmallVec<[Loc; 4]> {
        let (x, y) = loc.xy(self.x_size);
        let mut out = SmallVec::new();
        if x > 0 {
            out.push(Loc::from_xy(x - 1, y, self.x_size));
        }
        if x + 1 < self.x_size {
            out.push(Loc::from_xy(x + 1, y, self.x_size));
        }
        if y > 0 {
            out.push(Loc::from_xy(x, y - 1, self.x_size));
        }
        if y + 1 < self.y_size {
            out.push(Loc::from_xy(x, y + 1, self.x_size));
        }
        out
    }

    /// Flood-fill the chain containing `loc` and report whether it has any
    /// liberty. Visited stones are appended to `chain`.
    fn collect_chain(&self, loc: Loc, chain: &mut Vec<Loc>) -> bool {
        let color = self.color(loc);
        debug_assert!(color != Color::Empty);
        let mut has_liberty = false;
        let mut seen = vec![false; self.num_points()];
        let mut stack = vec![loc];
        seen[loc.index()] = true;
        while let Some(cur) = stack.pop() {
            chain.push(cur);
            for n in self.neighbors(cur) {
                match self.color(n) {
                    Color::Empty => has_liberty = true,
                    c if c == color => {
                        if !seen[n.index()] {
                            seen[n.index()] = true;
                            stack.push(n);
                        }
                    }
                    _ => {}
                }
            }
        }
        has_liberty
    }

    pub fn num_liberties(&self, loc: Loc) -> usize {
        if self.color(loc) == Color::Empty {
            return 0;
        }
        let mut chain = Vec::new();
        self.collect_chain(loc, &mut chain);
        let mut libs = vec![false; self.num_points()];
        let mut count = 0;
        for &stone in &chain {
            for n in self.neighbors(stone) {
                if self.color(n) == Color::Empty && !libs[n.index()] {
                    libs[n.index()] = true;
                    count += 1;
                }
            }
        }
        count
    }

    pub fn is_adjacent_to_pla(&self, loc: Loc, pla: Player) -> bool {
        self.neighbors(loc).iter().any(|&n| self.color(n) == Color::of(pla))
    }

    /// Whether `loc` is adjacent to the chain containing `chain_loc`.
    pub fn is_adjacent_to_chain(&self, loc: Loc, chain_loc: Loc) -> bool {
        if !self.is_on_board(chain_loc) || self.color(chain_loc) == Color::Empty {
            return false;
        }
        let mut chain = Vec::new();
        self.collect_chain(chain_loc, &mut chain);
        let set: std::collections::HashSet<Loc> = chain.into_iter().collect();
        self.neighbors(loc).iter().any(|n| set.contains(n))
    }

    /// Legality under simple ko. Pass is always legal.
    pub fn is_legal(&self, loc: Loc, pla: Player, multi_stone_suicide_legal: bool) -> bool {
        if loc == Loc::PASS {
            return true;
        }
        if !self.is_on_board(loc) || self.color(loc) != Color::Empty {
            return false;
        }
        if loc == self.ko_loc {
            return false;
        }
        // Any empty neighbor makes the move trivially alive.
        if self.neighbors(loc).iter().any(|&n| self.color(n) == Color::Empty) {
            return true;
        }
        // Captures something, or connects to a chain with a spare liberty?
        let opp_color = Color::of(pla.opp());
        let own_color = Color::of(pla);
        let mut scratch = self.clone();
        scratch.colors[loc.index()] = own_color;
        let mut captured_any = false;
        for n in scratch.neighbors(loc) {
            if scratch.color(n) == opp_color {
                let mut chain = Vec::new();
                if !scratch.collect_chain(n, &mut chain) {
                    captured_any = true;
                    for s in chain {
                        scratch.colors[s.index()] = Color::Empty;
                    }
                }
            }
        }
        let mut own_chain = Vec::new();
        let own_alive = scratch.collect_chain(loc, &mut own_chain);
        if own_alive || captured_any {
            return true;
        }
        multi_stone_suicide_legal && own_chain.len() > 1
    }

    /// Play a move assumed legal, maintaining captures, ko, and the hash.
    pub fn play_move_assume_legal(&mut self, loc: Loc, pla: Player) {
        self.clear_simple_ko_loc();
        if loc == Loc::PASS {
            return;
        }
        let own_color = Color::of(pla);
        let opp = pla.opp();
        let opp_color = Color::of(opp);
        self.colors[loc.index()] = own_color;
        self.pos_hash ^= zobrist::stone_hash(own_color, loc);

        let mut total_captured = 0usize;
        let mut single_captured_loc = Loc::NULL;
        for n in self.neighbors(loc) {
            if self.color(n) == opp_color {
                let mut chain = Vec::new();
                if !self.collect_chain(n, &mut chain) {
                    total_captured += chain.len();
                    if chain.len() == 1 {
                        single_captured_loc = chain[0];
                    }
                    for s in chain {
                        self.colors[s.index()] = Color::Empty;
                        self.pos_hash ^= zobrist::stone_hash(opp_color, s);
                    }
                }
            }
        }
        if total_captured > 0 {
            self.num_captured[opp as usize - 1] += total_captured as u32;
        } else {
            // Suicide of our own chain (only reachable when legal by rules).
            let mut chain = Vec::new();
            if !self.collect_chain(loc, &mut chain) {
                self.num_captured[pla as usize - 1] += chain.len() as u32;
                for s in chain {
                    self.colors[s.index()] = Color::Empty;
                    self.pos_hash ^= zobrist::stone_hash(own_color, s);
                }
                return;
            }
        }

        // Simple ko: a single-stone capture by a new single stone in atari.
        if total_captured == 1
            && single_captured_loc != Loc::NULL
            && self.num_liberties(loc) == 1
            && self.chain_size(loc) == 1
        {
            self.ko_loc = single_captured_loc;
            self.pos_hash ^= zobrist::ko_hash(self.ko_loc);
        }
    }

    fn chain_size(&self, loc: Loc) -> usize {
        let mut chain = Vec::new();
        self.collect_chain(loc, &mut chain);
        chain.len()
    }

    /// Approximate safe area: chains with at least two primitive eyes are
    /// safe, along with their eye regions. Everything else is `Empty`.
    /// Conservative by construction.
    pub fn calculate_area(&self, area: &mut [Color]) {
        let n = self.num_points();
        for a in area.iter_mut().take(n) {
            *a = Color::Empty;
        }
        // Find empty regions bordered by a single color.
        let mut region_id = vec![usize::MAX; n];
        let mut regions: Vec<(Color, Vec<Loc>)> = Vec::new();
        for i in 0..n {
            let loc = Loc(i as u16);
            if self.color(loc) != Color::Empty || region_id[i] != usize::MAX {
                continue;
            }
            let mut pts = Vec::new();
            let mut border: Option<Color> = None;
            let mut mixed = false;
            let mut stack = vec![loc];
            region_id[i] = regions.len();
            while let Some(cur) = stack.pop() {
                pts.push(cur);
                for nb in self.neighbors(cur) {
                    match self.color(nb) {
                        Color::Empty => {
                            if region_id[nb.index()] == usize::MAX {
                                region_id[nb.index()] = regions.len();
                                stack.push(nb);
                            }
                        }
                        c => match border {
                            None => border = Some(c),
                            Some(b) if b == c => {}
                            Some(_) => mixed = true,
                        },
                    }
                }
            }
            let owner = if mixed { Color::Empty } else { border.unwrap_or(Color::Empty) };
            regions.push((owner, pts));
        }
        // A chain with two adjacent single-colored regions of its own color
        // is treated as safe.
        let mut chain_seen = vec![false; n];
        for i in 0..n {
            let loc = Loc(i as u16);
            let color = self.color(loc);
            if color == Color::Empty || chain_seen[i] {
                continue;
            }
            let mut chain = Vec::new();
            self.collect_chain(loc, &mut chain);
            let mut eye_regions = std::collections::HashSet::new();
            for &s in &chain {
                chain_seen[s.index()] = true;
                for nb in self.neighbors(s) {
                    if self.color(nb) == Color::Empty {
                        let rid = region_id[nb.index()];
                        if regions[rid].0 == color {
                            eye_regions.insert(rid);
                        }
                    }
                }
            }
            if eye_regions.len() >= 2 {
                for &s in &chain {
                    area[s.index()] = color;
                }
                for rid in eye_regions {
                    for &p in &regions[rid].1 {
                        area[p.index()] = color;
                    }
                }
            }
        }
    }

    /// Whether playing at `loc` merely connects pla's own safe stones to
    /// each other (a pointless self-connection inside safe territory).
    pub fn is_non_pass_alive_self_connection(&self, loc: Loc, pla: Player, safe_area: &[Color]) -> bool {
        if safe_area[loc.index()] != Color::of(pla) {
            return false;
        }
        let mut own_neighbors = 0;
        for n in self.neighbors(loc) {
            if self.color(n) == Color::of(pla) {
                own_neighbors += 1;
            }
        }
        own_neighbors >= 2
    }

    /// Area score from white's perspective: every point occupied by or
    /// surrounded solely by a color counts for it.
    pub fn area_score_white_minus_black(&self) -> f64 {
        let n = self.num_points();
        let mut score = 0i32;
        let mut seen = vec![false; n];
        for i in 0..n {
            let loc = Loc(i as u16);
            match self.color(loc) {
                Color::Black => score -= 1,
                Color::White => score += 1,
                Color::Empty => {
                    if seen[i] {
                        continue;
                    }
                    let mut pts = Vec::new();
                    let mut border: Option<Color> = None;
                    let mut mixed = false;
                    let mut stack = vec![loc];
                    seen[i] = true;
                    while let Some(cur) = stack.pop() {
                        pts.push(cur);
                        for nb in self.neighbors(cur) {
                            match self.color(nb) {
                                Color::Empty => {
                                    if !seen[nb.index()] {
                                        seen[nb.index()] = true;
                                        stack.push(nb);
                                    }
                                }
                                c => match border {
                                    None => border = Some(c),
                                    Some(b) if b == c => {}
                                    Some(_) => mixed = true,
                                },
                            }
                        }
                    }
                    if !mixed {
                        match border {
                            Some(Color::Black) => score -= pts.len() as i32,
                            Some(Color::White) => score += pts.len() as i32,
                            _ => {}
                        }
                    }
                }
            }
        }
        score as f64
    }

    /// Apply a symmetry (bit 0 flip x, bit 1 flip y, bit 2 transpose) to a
    /// location. Transposition is only meaningful on square boards.
    pub fn symmetry_of_loc(&self, loc: Loc, symmetry: usize) -> Loc {
        if !loc.is_on_board() {
            return loc;
        }
        let (mut x, mut y) = loc.xy(self.x_size);
        if symmetry & 0x4 != 0 {
            std::mem::swap(&mut x, &mut y);
        }
        if symmetry & 0x1 != 0 {
            x = self.x_size - 1 - x;
        }
        if symmetry & 0x2 != 0 {
            y = self.y_size - 1 - y;
        }
        Loc::from_xy(x, y, self.x_size)
    }

    /// Whether this board position maps onto itself under the symmetry.
    pub fn is_symmetry_of_self(&self, symmetry: usize) -> bool {
        if symmetry & 0x4 != 0 && self.x_size != self.y_size {
            return false;
        }
        if self.ko_loc != Loc::NULL && self.symmetry_of_loc(self.ko_loc, symmetry) != self.ko_loc {
            return false;
        }
        for i in 0..self.num_points() {
            let loc = Loc(i as u16);
            if self.color(loc) != self.color(self.symmetry_of_loc(loc, symmetry)) {
                return false;
            }
        }
        true
    }

    /// Mark duplicate root moves: for each symmetry fixing the position
    /// (restricted to `only_symmetries` when given), the lexically larger of
    /// each symmetric move pair is marked as a duplicate. Returns the list
    /// of fixing symmetries.
    pub fn mark_duplicate_move_locs(
        &self,
        only_symmetries: Option<&[usize]>,
        avoid_move_until_by_loc: &[i32],
        dup_loc: &mut [bool],
    ) -> Vec<usize> {
        for d in dup_loc.iter_mut().take(self.num_points()) {
            *d = false;
        }
        let mut fixing = Vec::new();
        for sym in 0..NUM_SYMMETRIES {
            let considered = match only_symmetries {
                Some(set) => set.contains(&sym),
                None => true,
            };
            if !considered || !self.is_symmetry_of_self(sym) {
                continue;
            }
            fixing.push(sym);
            if sym == 0 {
                continue;
            }
            for i in 0..self.num_points() {
                let loc = Loc(i as u16);
                if self.color(loc) != Color::Empty {
                    continue;
                }
                let img = self.symmetry_of_loc(loc, sym);
                // Avoid-gated moves are not used as canonical representatives.
                let gated = |l: Loc| {
                    !avoid_move_until_by_loc.is_empty() && avoid_move_until_by_loc[l.index()] > 0
                };
                if img > loc && !gated(loc) {
                    dup_loc[img.index()] = true;
                }
            }
        }
        fixing
    }

    /// Zobrist-style hash of the (2*radius+1)^2 window centered on `loc`,
    /// mixed with the window's geometry. Used for local-pattern fingerprints.
    pub fn local_pattern_hash(&self, loc: Loc, radius: i32) -> Hash128 {
        if !loc.is_on_board() {
            return Hash128::ZERO.mix(0x706173735f6c6f63);
        }
        let (cx, cy) = loc.xy(self.x_size);
        let mut h = Hash128::ZERO;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let x = cx as i32 + dx;
                let y = cy as i32 + dy;
                let cell = if x < 0 || y < 0 || x >= self.x_size as i32 || y >= self.y_size as i32 {
                    3u64
                } else {
                    self.color(Loc::from_xy(x as usize, y as usize, self.x_size)) as u64
                };
                h = h.mix(cell.wrapping_add(((dx + radius) as u64) << 8).wrapping_add(((dy + radius) as u64) << 16));
            }
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(board: &mut Board, x: usize, y: usize, pla: Player) {
        let loc = Loc::from_xy(x, y, board.x_size);
        assert!(board.is_legal(loc, pla, false), "move should be legal");
        board.play_move_assume_legal(loc, pla);
    }

    #[test]
    fn test_capture_single_stone() {
        let mut b = Board::new(5, 5);
        play(&mut b, 1, 1, Player::White);
        play(&mut b, 0, 1, Player::Black);
        play(&mut b, 2, 1, Player::Black);
        play(&mut b, 1, 0, Player::Black);
        play(&mut b, 1, 2, Player::Black);
        assert_eq!(b.color(Loc::from_xy(1, 1, 5)), Color::Empty);
        assert_eq!(b.num_captured[1], 1);
    }

    #[test]
    fn test_simple_ko() {
        let mut b = Board::new(5, 5);
        // Classic ko shape around (1,1)/(2,1).
        play(&mut b, 1, 0, Player::Black);
        play(&mut b, 2, 0, Player::White);
        play(&mut b, 0, 1, Player::Black);
        play(&mut b, 3, 1, Player::White);
        play(&mut b, 1, 2, Player::Black);
        play(&mut b, 2, 2, Player::White);
        play(&mut b, 2, 1, Player::Black);
        // White captures at (1,1), creating a ko at (2,1).
        play(&mut b, 1, 1, Player::White);
        assert_eq!(b.color(Loc::from_xy(2, 1, 5)), Color::Empty);
        assert_eq!(b.ko_loc, Loc::from_xy(2, 1, 5));
        assert!(!b.is_legal(Loc::from_xy(2, 1, 5), Player::Black, false));
        // After a move elsewhere the ko lifts.
        play(&mut b, 4, 4, Player::Black);
        assert!(b.is_legal(Loc::from_xy(2, 1, 5), Player::White, false));
    }

    #[test]
    fn test_suicide_illegal() {
        let mut b = Board::new(5, 5);
        play(&mut b, 0, 1, Player::Black);
        play(&mut b, 1, 0, Player::Black);
        assert!(!b.is_legal(Loc::from_xy(0, 0, 5), Player::White, false));
        // Multi-stone suicide stays illegal for a single stone even when
        // the rules allow it.
        assert!(!b.is_legal(Loc::from_xy(0, 0, 5), Player::White, true));
    }

    #[test]
    fn test_pos_hash_changes_and_restores() {
        let mut b = Board::new(5, 5);
        let h0 = b.pos_hash;
        play(&mut b, 2, 2, Player::Black);
        assert_ne!(b.pos_hash, h0);
        let mut c = Board::new(5, 5);
        play(&mut c, 2, 2, Player::Black);
        assert_eq!(b.pos_hash, c.pos_hash);
    }

    #[test]
    fn test_area_score_empty_board_is_zero() {
        let b = Board::new(5, 5);
        assert_eq!(b.area_score_white_minus_black(), 0.0);
    }

    #[test]
    fn test_area_score_counts_territory() {
        let mut b = Board::new(5, 5);
        // A black wall on column 2 owning the left side.
        for y in 0..5 {
            play(&mut b, 2, y, Player::Black);
        }
        // Stones 5 + territory 10 on each side.
        assert_eq!(b.area_score_white_minus_black(), -25.0);
    }

    #[test]
    fn test_symmetry_detection() {
        let mut b = Board::new(5, 5);
        assert!(b.is_symmetry_of_self(1));
        assert!(b.is_symmetry_of_self(7));
        play(&mut b, 0, 0, Player::Black);
        assert!(!b.is_symmetry_of_self(1));
        // Diagonal symmetry still holds for a corner stone at (0,0).
        assert!(b.is_symmetry_of_self(4));
    }

    #[test]
    fn test_mark_duplicate_move_locs() {
        let b = Board::new(5, 5);
        let mut dup = vec![false; b.num_points()];
        let fixing = b.mark_duplicate_move_locs(None, &[], &mut dup);
        assert_eq!(fixing.len(), NUM_SYMMETRIES);
        // On an empty square board only a fundamental-domain wedge of moves
        // survives.
        let surviving = dup.iter().filter(|&&d| !d).count();
        assert!(surviving <= 6, "expected <= 6 canonical moves, got {surviving}");
        assert!(!dup[Loc::center(5, 5).index()]);
    }

    #[test]
    fn test_calculate_area_two_eyes() {
        let mut b = Board::new(5, 5);
        // Black group with two one-point eyes at (0,0) and (2,0). White
        // stones keep the rest of the board contested.
        for (x, y) in [(1, 0), (0, 1), (1, 1), (2, 1), (3, 0), (3, 1)] {
            play(&mut b, x, y, Player::Black);
        }
        play(&mut b, 4, 3, Player::White);
        play(&mut b, 3, 4, Player::White);
        let mut area = vec![Color::Empty; b.num_points()];
        b.calculate_area(&mut area);
        assert_eq!(area[Loc::from_xy(0, 0, 5).index()], Color::Black);
        assert_eq!(area[Loc::from_xy(1, 0, 5).index()], Color::Black);
        assert_eq!(area[Loc::from_xy(2, 0, 5).index()], Color::Black);
        assert_eq!(area[Loc::from_xy(3, 3, 5).index()], Color::Empty);
        assert_eq!(area[Loc::from_xy(4, 4, 5).index()], Color::Empty);
    }
}
