//! Zobrist tables for board hashing, generated lazily from a fixed seed so
//! hashes are stable within a process run and across processes.

use crate::types::{Color, Hash128, Loc};
use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use super::MAX_ARR_SIZE;

struct Tables {
    stones: [[Hash128; MAX_ARR_SIZE]; 2],
    ko: [Hash128; MAX_ARR_SIZE],
    sizes: [[Hash128; 20]; 20],
}

static TABLES: Lazy<Tables> = Lazy::new(|| {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x676f5f7a6f627269);
    let mut draw = || Hash128::new(rng.gen(), rng.gen());
    let mut stones = [[Hash128::ZERO; MAX_ARR_SIZE]; 2];
    for table in stones.iter_mut() {
        for h in table.iter_mut() {
            *h = draw();
        }
    }
    let mut ko = [Hash128::ZERO; MAX_ARR_SIZE];
    for h in ko.iter_mut() {
        *h = draw();
    }
    let mut sizes = [[Hash128::ZERO; 20]; 20];
    for row in sizes.iter_mut() {
        for h in row.iter_mut() {
            *h = draw();
        }
    }
    Tables { stones, ko, sizes }
});

#[inline]
pub fn stone_hash(color: Color, loc: Loc) -> Hash128 {
    debug_assert!(color != Color::Empty);
    TABLES.stones[color as usize - 1][loc.index()]
}

#[inline]
pub fn ko_hash(loc: Loc) -> Hash128 {
    TABLES.ko[loc.index()]
}

#[inline]
pub fn size_hash(x_size: usize, y_size: usize) -> Hash128 {
    TABLES.sizes[x_size][y_size]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_stable_and_distinct() {
        let a = stone_hash(Color::Black, Loc(0));
        let b = stone_hash(Color::White, Loc(0));
        let c = stone_hash(Color::Black, Loc(1));
        assert_eq!(a, stone_hash(Color::Black, Loc(0)));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(size_hash(9, 9), size_hash(19, 19));
    }
}
