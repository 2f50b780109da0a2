//! Guarded fiber stacks
//!
//! Each stack is its own anonymous mapping with a `PROT_NONE` guard page
//! at the low end, so an overflow faults instead of corrupting the
//! neighbouring allocation. Platform code lives in the submodules.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("Unsupported platform");
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

static STACKS_MAPPED: AtomicU64 = AtomicU64::new(0);
static STACKS_UNMAPPED: AtomicU64 = AtomicU64::new(0);

/// Stack mappings created by this process so far
#[inline]
pub fn stacks_mapped() -> u64 {
    STACKS_MAPPED.load(Ordering::Relaxed)
}

/// Stack mappings currently alive
#[inline]
pub fn stacks_live() -> u64 {
    stacks_mapped() - STACKS_UNMAPPED.load(Ordering::Relaxed)
}

#[inline]
fn note_mapped() {
    STACKS_MAPPED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn note_unmapped() {
    STACKS_UNMAPPED.fetch_add(1, Ordering::Relaxed);
}
