//! 128-bit hashes used for position identity, graph search, and pattern
//! fingerprints.

use std::fmt;
use std::ops::{BitXor, BitXorAssign};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash128 {
    pub hash0: u64,
    pub hash1: u64,
}

impl Hash128 {
    pub const ZERO: Hash128 = Hash128 { hash0: 0, hash1: 0 };

    #[inline]
    pub fn new(hash0: u64, hash1: u64) -> Hash128 {
        Hash128 { hash0, hash1 }
    }

    /// Mix an arbitrary u64 into this hash, producing a new hash.
    /// Uses a splitmix64-style finalizer on each half so that single-bit
    /// input differences diffuse across the whole output.
    pub fn mix(self, x: u64) -> Hash128 {
        Hash128 {
            hash0: splitmix64(self.hash0 ^ x),
            hash1: splitmix64(self.hash1 ^ x.rotate_left(32) ^ 0x9e3779b97f4a7c15),
        }
    }
}

#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

impl BitXor for Hash128 {
    type Output = Hash128;
    #[inline]
    fn bitxor(self, rhs: Hash128) -> Hash128 {
        Hash128 {
            hash0: self.hash0 ^ rhs.hash0,
            hash1: self.hash1 ^ rhs.hash1,
        }
    }
}

impl BitXorAssign for Hash128 {
    #[inline]
    fn bitxor_assign(&mut self, rhs: Hash128) {
        self.hash0 ^= rhs.hash0;
        self.hash1 ^= rhs.hash1;
    }
}

impl fmt::Display for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.hash1, self.hash0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_roundtrip() {
        let a = Hash128::new(0x1234, 0x5678);
        let b = Hash128::new(0xdeadbeef, 0xcafebabe);
        assert_eq!(a ^ b ^ b, a);
        assert_eq!(a ^ Hash128::ZERO, a);
    }

    #[test]
    fn test_mix_diffuses() {
        let a = Hash128::ZERO.mix(1);
        let b = Hash128::ZERO.mix(2);
        assert_ne!(a, b);
        assert_ne!(a.hash0, 0);
        // Mixing is order-sensitive.
        assert_ne!(Hash128::ZERO.mix(1).mix(2), Hash128::ZERO.mix(2).mix(1));
    }

    #[test]
    fn test_display() {
        let h = Hash128::new(0xff, 0x1);
        assert_eq!(format!("{h}"), "000000000000000100000000000000ff");
    }
}
