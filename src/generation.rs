//! Stable and unstable generation pair
//!
//! Every checkpoint closes a generation: what was unstable becomes stable and
//! a new unstable generation starts. Both values are packed into one `u64` so
//! readers can load them in a single atomic operation.

use std::fmt;

/// Lowest generation a pointer or node can carry
pub const MIN_GENERATION: u64 = 1;

/// Highest generation, bounded by the 32 bits it is stored in
pub const MAX_GENERATION: u64 = u32::MAX as u64;

const UNSTABLE_MASK: u64 = 0xFFFF_FFFF;

/// The generations currently in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationPair {
    /// Last checkpointed generation
    pub stable: u64,
    /// Generation being written now
    pub unstable: u64,
}

impl GenerationPair {
    /// Create a pair
    pub const fn new(stable: u64, unstable: u64) -> Self {
        Self { stable, unstable }
    }

    /// Generations of a freshly created tree, before its first checkpoint
    pub const fn initial() -> Self {
        Self::new(MIN_GENERATION, MIN_GENERATION + 1)
    }

    /// Pack into a single word, stable in the high half
    pub const fn pack(self) -> u64 {
        (self.stable << 32) | (self.unstable & UNSTABLE_MASK)
    }

    /// Unpack a word produced by [`pack`](Self::pack)
    pub const fn unpack(packed: u64) -> Self {
        Self { stable: packed >> 32, unstable: packed & UNSTABLE_MASK }
    }

    /// The pair after a checkpoint
    pub const fn checkpointed(self) -> Self {
        Self::new(self.unstable, self.unstable + 1)
    }

    /// The pair with the unstable generation bumped, leaving a gap of crashed generations
    pub const fn bumped(self) -> Self {
        Self::new(self.stable, self.unstable + 1)
    }
}

impl fmt::Display for GenerationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stable, self.unstable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let pair = GenerationPair::new(17, 42);
        assert_eq!(GenerationPair::unpack(pair.pack()), pair);

        let max = GenerationPair::new(MAX_GENERATION - 1, MAX_GENERATION);
        assert_eq!(GenerationPair::unpack(max.pack()), max);
    }

    #[test]
    fn test_checkpoint_and_bump() {
        let pair = GenerationPair::initial();
        assert_eq!(pair, GenerationPair::new(1, 2));
        assert_eq!(pair.checkpointed(), GenerationPair::new(2, 3));
        assert_eq!(pair.bumped(), GenerationPair::new(1, 3));
        assert_eq!(pair.bumped().checkpointed(), GenerationPair::new(3, 4));
    }
}
