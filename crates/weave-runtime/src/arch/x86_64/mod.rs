//! x86_64 context switching (System V AMD64)
//!
//! Callee-saved registers only: a switch is an ordinary function call
//! from the compiler's point of view, so everything else is already
//! spilled by the caller.

use std::arch::naked_asm;

use super::{entry_returned, FiberEntry};

/// Saved callee-saved state; offsets are used by the assembly below
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Aim `regs` at `entry(arg)` on a fresh stack.
///
/// The trampoline is entered by `jmp`, so `rsp` must be 16-byte aligned
/// there: its `call` then leaves the entry with the usual `rsp % 16 == 8`.
///
/// # Safety
///
/// `regs` must be valid for writes.
#[inline]
pub unsafe fn init_context(regs: *mut Registers, stack_top: *mut u8, entry: FiberEntry, arg: usize) {
    let sp = (stack_top as usize) & !0xF;
    let regs = &mut *regs;
    *regs = Registers::default();
    regs.rsp = sp as u64;
    regs.rip = fiber_trampoline as usize as u64;
    regs.r12 = entry as usize as u64;
    regs.r13 = arg as u64;
}

/// First code run on a fresh stack
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {returned}",
        "ud2",
        returned = sym entry_returned,
    );
}

/// Save into `_from` (rdi), resume `_to` (rsi)
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_from: *mut Registers, _to: *const Registers) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resumed switches land here with the caller's return address on top.
        "2:",
        "ret",
    );
}
