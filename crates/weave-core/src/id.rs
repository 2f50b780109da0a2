//! Fiber identifier

use core::fmt;

/// Fiber identifier: strand-local slot index plus a reuse generation.
///
/// The generation bumps every time a dead fiber's slot is recycled, so a
/// wakeup that crossed threads after the original fiber exited cannot
/// resume the new occupant. Packs into one machine word for async calls.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    index: u32,
    generation: u32,
}

impl FiberId {
    /// Sentinel for "no fiber"
    pub const NONE: FiberId = FiberId { index: u32::MAX, generation: 0 };

    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        FiberId { index, generation }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.index == u32::MAX
    }

    /// Same slot, next generation
    #[inline]
    pub const fn next_generation(self) -> Self {
        FiberId { index: self.index, generation: self.generation.wrapping_add(1) }
    }

    #[inline]
    pub const fn to_word(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_word(word: u64) -> Self {
        FiberId { index: word as u32, generation: (word >> 32) as u32 }
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({}.{})", self.index, self.generation)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}.{}", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_packing() {
        let id = FiberId::new(17, 0xdead_beef);
        assert_eq!(FiberId::from_word(id.to_word()), id);
        assert!(FiberId::NONE.is_none());
    }

    #[test]
    fn test_generation_distinguishes() {
        let a = FiberId::new(3, u32::MAX);
        let b = a.next_generation();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(b.generation(), 0);
    }
}
