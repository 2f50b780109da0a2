//! Thread-local pointers to the running strand and context
//!
//! Both are set while the owning thread is inside the runtime and cleared
//! (restored) when it leaves. Fibers on the same thread share them.

use std::cell::Cell;
use std::ptr;

use crate::context::Context;
use crate::strand::Strand;

thread_local! {
    static CURRENT_STRAND: Cell<*const Strand> = const { Cell::new(ptr::null()) };
    static CURRENT_CONTEXT: Cell<*const Context> = const { Cell::new(ptr::null()) };
}

/// Restores the previous thread-local pointers on drop
pub struct TlsGuard {
    strand: *const Strand,
    context: *const Context,
}

impl Drop for TlsGuard {
    fn drop(&mut self) {
        CURRENT_STRAND.with(|c| c.set(self.strand));
        CURRENT_CONTEXT.with(|c| c.set(self.context));
        match context() {
            Some(ctx) => weave_core::kprint::set_context_tag(ctx.index()),
            None => weave_core::kprint::clear_context_tag(),
        }
    }
}

/// Make `strand` (and optionally `context`) current for this thread
pub(crate) fn enter(strand: &Strand, context: Option<&Context>) -> TlsGuard {
    let strand_prev = CURRENT_STRAND.with(|c| c.replace(strand as *const Strand));
    let context_ptr = context.map_or(ptr::null(), |c| c as *const Context);
    let context_prev = CURRENT_CONTEXT.with(|c| c.replace(context_ptr));
    if let Some(ctx) = context {
        weave_core::kprint::set_context_tag(ctx.index());
    }
    TlsGuard { strand: strand_prev, context: context_prev }
}

/// The strand entered on this thread.
///
/// The pointer is only set while a `TlsGuard` borrowing the strand is
/// alive, so the reference is valid for as long as the caller stays
/// inside the runtime.
#[inline]
pub fn strand<'a>() -> Option<&'a Strand> {
    let p = CURRENT_STRAND.with(|c| c.get());
    unsafe { p.as_ref() }
}

/// The context entered on this thread
#[inline]
pub fn context<'a>() -> Option<&'a Context> {
    let p = CURRENT_CONTEXT.with(|c| c.get());
    unsafe { p.as_ref() }
}

#[inline]
pub(crate) fn context_ptr() -> *const Context {
    CURRENT_CONTEXT.with(|c| c.get())
}

/// True if the calling thread is the one running `ctx`
#[inline]
pub fn is_owner(ctx: &Context) -> bool {
    ptr::eq(context_ptr(), ctx)
}

/// Index of the calling thread's context
#[inline]
pub fn context_index() -> Option<u32> {
    context().map(Context::index)
}
