//! aarch64 context switching (AAPCS64)
//!
//! Saves x19-x28, the frame pointer, the link register, `sp` and the low
//! halves of v8-v15. Resuming is a `ret` through the restored x30.

use std::arch::naked_asm;

use super::{entry_returned, FiberEntry};

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    /// x19..=x30 at offsets 0..96
    pub x: [u64; 12],
    /// offset 96
    pub sp: u64,
    /// d8..=d15 at offsets 104..168
    pub d: [u64; 8],
}

/// Aim `regs` at `entry(arg)` on a fresh stack.
///
/// # Safety
///
/// `regs` must be valid for writes.
#[inline]
pub unsafe fn init_context(regs: *mut Registers, stack_top: *mut u8, entry: FiberEntry, arg: usize) {
    let regs = &mut *regs;
    *regs = Registers::default();
    regs.sp = ((stack_top as usize) & !0xF) as u64;
    regs.x[0] = entry as usize as u64; // x19
    regs.x[1] = arg as u64; // x20
    regs.x[11] = fiber_trampoline as usize as u64; // x30
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "bl {returned}",
        "brk #0",
        returned = sym entry_returned,
    );
}

/// Save into `_from` (x0), resume `_to` (x1)
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_from: *mut Registers, _to: *const Registers) {
    naked_asm!(
        "stp x19, x20, [x0, #0]",
        "stp x21, x22, [x0, #16]",
        "stp x23, x24, [x0, #32]",
        "stp x25, x26, [x0, #48]",
        "stp x27, x28, [x0, #64]",
        "stp x29, x30, [x0, #80]",
        "mov x9, sp",
        "str x9, [x0, #96]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        "ldp x19, x20, [x1, #0]",
        "ldp x21, x22, [x1, #16]",
        "ldp x23, x24, [x1, #32]",
        "ldp x25, x26, [x1, #48]",
        "ldp x27, x28, [x1, #64]",
        "ldp x29, x30, [x1, #80]",
        "ldr x9, [x1, #96]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    );
}
