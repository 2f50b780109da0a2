//! Architecture-specific context switching
//!
//! Each architecture provides a `Registers` save area, `init_context` to
//! aim a fresh save area at a stack and entry function, and the naked
//! `context_switch` that stores the callee-saved state of the running
//! code into one area and resumes another.
//!
//! [`Continuation`] is the safe-ish wrapper the strand uses: one per
//! fiber, switched with [`Continuation::switch`].

use core::cell::UnsafeCell;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        use self::x86_64 as imp;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        use self::aarch64 as imp;
    } else {
        compile_error!("Unsupported architecture");
    }
}

pub use imp::Registers;

/// Entry point run on a fresh stack; receives the word given to `prepare`
pub type FiberEntry = extern "C" fn(usize) -> !;

/// Saved execution state of one fiber
pub struct Continuation {
    regs: UnsafeCell<Registers>,
}

impl Continuation {
    /// An empty save area, filled in by the first switch away from it
    pub fn new() -> Self {
        Continuation { regs: UnsafeCell::new(Registers::default()) }
    }

    /// Arrange for the next switch into this continuation to call
    /// `entry(arg)` on the stack ending at `stack_top`.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the high end of a writable stack that stays
    /// mapped until the fiber has switched away for the last time.
    pub unsafe fn prepare(&self, stack_top: *mut u8, entry: FiberEntry, arg: usize) {
        imp::init_context(self.regs.get(), stack_top, entry, arg);
    }

    /// Save the running state into `from` and resume `to`.
    ///
    /// Returns when something later switches back into `from`.
    ///
    /// # Safety
    ///
    /// `from` must describe the code currently running and `to` must hold
    /// either a prepared entry or state saved by an earlier switch whose
    /// stack is still alive. No borrow of anything the resumed code may
    /// mutate can be live across the call.
    #[inline]
    pub unsafe fn switch(from: &Continuation, to: &Continuation) {
        imp::context_switch(from.regs.get(), to.regs.get());
    }
}

impl Default for Continuation {
    fn default() -> Self {
        Self::new()
    }
}

/// Called if an entry function ever returns into the trampoline
extern "C" fn entry_returned() -> ! {
    weave_core::fatal!("fiber entry returned into the switch trampoline")
}
