//! PCG32 generator shared by every participant of a game.
//!
//! The engine seeds one [`Pcg32`] from the seed in `ServerStartGame`, so every participant draws
//! the same sequence as long as it draws in the same order. It is not cryptographically secure.
//!
//! ```rust
//! use lockstep_mesh::rng::{Pcg32, Rng};
//!
//! let mut a = Pcg32::from_game_seed(42);
//! let mut b = Pcg32::from_game_seed(42);
//! assert_eq!(a.gen_range(0..100), b.gen_range(0..100));
//! ```

use crate::{
    report_violation,
    telemetry::{ViolationKind, ViolationSeverity},
};

/// PCG-XSH-RR with 64 bits of state and 32-bit output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Stream selector used for game seeds.
const PCG_DEFAULT_STREAM: u64 = 1442695040888963407;

const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Creates a generator from an initial state and a stream selector.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Creates the generator every participant derives from a game seed.
    ///
    /// The seed is sign-extended, so negative seeds are distinct from their unsigned
    /// reinterpretation.
    #[must_use]
    pub const fn from_game_seed(seed: i32) -> Self {
        Self::new(seed as i64 as u64, PCG_DEFAULT_STREAM)
    }

    /// Generates the next 32-bit value.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Generates the next 64-bit value from two 32-bit draws, high half first.
    #[inline]
    #[must_use]
    pub fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }
}

/// Random draws built on top of a 32-bit source.
pub trait Rng {
    /// Returns the next 32-bit value.
    fn next_u32(&mut self) -> u32;

    /// Generates a value in `[range.start, range.end)` without modulo bias.
    ///
    /// An empty range is reported as a violation and yields `range.start`.
    fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.is_empty() || span == 0 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range called with empty range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }

        let threshold = span.wrapping_neg() % span;
        loop {
            let random_value = self.next_u32();
            if random_value >= threshold {
                return range.start.wrapping_add(random_value % span);
            }
        }
    }

    /// Generates an `i32` in `[low, high]`.
    ///
    /// `low > high` is reported as a violation and yields `low`.
    fn gen_range_i32_inclusive(&mut self, range: std::ops::RangeInclusive<i32>) -> i32 {
        let (start, end) = (*range.start(), *range.end());
        if start > end {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range_i32_inclusive called with invalid range [{}..={}]",
                start,
                end
            );
            return start;
        }
        let span = (i64::from(end) - i64::from(start) + 1) as u64;
        if span > u64::from(u32::MAX) {
            // Full i32 range.
            return self.next_u32() as i32;
        }
        let offset = self.gen_range(0..span as u32);
        start.wrapping_add(offset as i32)
    }

    /// Returns `true` with the given probability, clamped to `[0.0, 1.0]`.
    fn gen_bool(&mut self, probability: f64) -> bool {
        let p = probability.clamp(0.0, 1.0);
        let threshold = (p * f64::from(u32::MAX)) as u32;
        self.next_u32() < threshold
    }
}

impl Rng for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        Self::next_u32(self)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Pcg32::from_game_seed(42);
        let mut b = Pcg32::from_game_seed(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Pcg32::from_game_seed(1);
        let mut b = Pcg32::from_game_seed(2);
        let same = (0..16).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(same < 16);
    }

    #[test]
    fn negative_seed_is_sign_extended() {
        assert_eq!(
            Pcg32::from_game_seed(-1),
            Pcg32::new(u64::MAX, PCG_DEFAULT_STREAM)
        );
        assert_ne!(
            Pcg32::from_game_seed(-1),
            Pcg32::new(u64::from(u32::MAX), PCG_DEFAULT_STREAM)
        );
    }

    #[test]
    fn next_u64_is_two_draws_high_first() {
        let mut a = Pcg32::from_game_seed(7);
        let mut b = a.clone();
        let high = u64::from(b.next_u32());
        let low = u64::from(b.next_u32());
        assert_eq!(a.next_u64(), (high << 32) | low);
    }

    #[test]
    fn gen_range_stays_in_bounds() {
        let mut rng = Pcg32::from_game_seed(99);
        for _ in 0..1000 {
            let v = rng.gen_range(10..20);
            assert!((10..20).contains(&v));
        }
    }

    #[test]
    fn empty_range_returns_start() {
        let mut rng = Pcg32::from_game_seed(0);
        assert_eq!(rng.gen_range(5..5), 5);
        assert_eq!(rng.gen_range_i32_inclusive(3..=1), 3);
    }

    #[test]
    fn inclusive_range_covers_negative_values() {
        let mut rng = Pcg32::from_game_seed(3);
        let mut seen_low = false;
        let mut seen_high = false;
        for _ in 0..1000 {
            let v = rng.gen_range_i32_inclusive(-2..=2);
            assert!((-2..=2).contains(&v));
            seen_low |= v == -2;
            seen_high |= v == 2;
        }
        assert!(seen_low && seen_high);
        let _ = rng.gen_range_i32_inclusive(i32::MIN..=i32::MAX);
    }

    #[test]
    fn gen_bool_extremes() {
        let mut rng = Pcg32::from_game_seed(11);
        for _ in 0..100 {
            assert!(!rng.gen_bool(0.0));
        }
        let trues = (0..1000).filter(|_| rng.gen_bool(1.0)).count();
        assert!(trues > 990);
    }
}
