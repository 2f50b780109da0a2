//! Cache-line padding for hot atomics

use core::ops::Deref;

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "aarch64", target_arch = "powerpc64"))] {
        /// Pads and aligns `T` to a cache line (128 bytes: adjacent-line prefetch)
        #[derive(Debug, Default)]
        #[repr(C, align(128))]
        pub struct CachePadded<T> {
            value: T,
        }
    } else {
        /// Pads and aligns `T` to a cache line
        #[derive(Debug, Default)]
        #[repr(C, align(64))]
        pub struct CachePadded<T> {
            value: T,
        }
    }
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        CachePadded { value }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn test_alignment() {
        assert!(core::mem::align_of::<CachePadded<AtomicUsize>>() >= 64);
        let pair = [CachePadded::new(1u8), CachePadded::new(2u8)];
        let a = &pair[0] as *const _ as usize;
        let b = &pair[1] as *const _ as usize;
        assert!(b - a >= 64);
        assert_eq!(*pair[1], 2);
    }
}
