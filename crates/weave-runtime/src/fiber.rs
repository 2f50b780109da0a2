//! Fiber control block
//!
//! A fiber is owned by exactly one [`Strand`] and only ever touched from
//! that strand's OS thread, so all of its fields are plain `Cell`s. The
//! strand keeps every fiber boxed in a slot table; the box address is
//! what the stack-switch trampoline receives as its argument.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use weave_core::{Canceled, FiberFlags, FiberId, FiberState, Priority};

use crate::arch::Continuation;
use crate::memory::Stack;
use crate::strand::Strand;

/// Outcome of a fiber: its value, or the cancellation marker
pub type FiberResult = Result<usize, Canceled>;

/// Body of a fiber
pub type FiberBody = Box<dyn FnOnce() -> FiberResult>;

/// Handler run when the fiber exits by any path
pub type CleanupHandler = Box<dyn FnOnce()>;

pub struct Fiber {
    pub(crate) id: Cell<FiberId>,
    pub(crate) name: Cell<Option<&'static str>>,
    pub(crate) state: Cell<FiberState>,
    pub(crate) flags: Cell<FiberFlags>,
    pub(crate) base_priority: Cell<Priority>,
    pub(crate) priority: Cell<Priority>,
    pub(crate) stack: Option<Stack>,
    pub(crate) continuation: Continuation,
    pub(crate) body: Cell<Option<FiberBody>>,
    pub(crate) cleanup: RefCell<Vec<CleanupHandler>>,
    pub(crate) result: Cell<Option<FiberResult>>,
    /// Joiners and the cell on their stack that receives the result
    pub(crate) joiners: RefCell<Vec<(FiberId, *const Cell<Option<FiberResult>>)>>,
    pub(crate) strand: *const Strand,
}

impl Fiber {
    pub(crate) fn new(id: FiberId, stack: Option<Stack>, strand: *const Strand) -> Self {
        Fiber {
            id: Cell::new(id),
            name: Cell::new(None),
            state: Cell::new(FiberState::Invalid),
            flags: Cell::new(FiberFlags::empty()),
            base_priority: Cell::new(Priority::DEFAULT),
            priority: Cell::new(Priority::DEFAULT),
            stack,
            continuation: Continuation::new(),
            body: Cell::new(None),
            cleanup: RefCell::new(Vec::new()),
            result: Cell::new(None),
            joiners: RefCell::new(Vec::new()),
            strand,
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id.get()
    }

    #[inline]
    pub fn name(&self) -> Option<&'static str> {
        self.name.get()
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    #[inline]
    pub fn flags(&self) -> FiberFlags {
        self.flags.get()
    }

    /// Effective priority (base, or higher while hoisted)
    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority.get()
    }

    #[inline]
    pub fn base_priority(&self) -> Priority {
        self.base_priority.get()
    }

    /// The master fiber runs on the thread's own stack
    #[inline]
    pub fn is_master(&self) -> bool {
        self.stack.is_none()
    }

    #[inline]
    pub(crate) fn set_flag(&self, flag: FiberFlags) {
        self.flags.set(self.flags.get().with(flag));
    }

    #[inline]
    pub(crate) fn clear_flag(&self, flag: FiberFlags) {
        self.flags.set(self.flags.get().without(flag));
    }

    /// Stack usable size, if this fiber has one
    pub(crate) fn stack_fits(&self, size: usize) -> bool {
        self.stack.as_ref().is_some_and(|s| s.fits(size))
    }

    /// Aim the continuation at `fiber_main` on this fiber's stack
    pub(crate) fn prepare(&self) {
        if let Some(stack) = &self.stack {
            // Safety: the stack lives as long as the fiber, and a dead
            // fiber never resumes its old frames.
            unsafe {
                self.continuation.prepare(stack.top(), fiber_main, self as *const Fiber as usize);
            }
        }
    }

    /// Run cleanup handlers newest first. Each handler is popped before
    /// it runs so it may push or pop handlers itself.
    pub(crate) fn run_cleanup(&self) {
        loop {
            let handler = self.cleanup.borrow_mut().pop();
            match handler {
                Some(handler) => handler(),
                None => break,
            }
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("priority", &self.priority())
            .field("flags", &self.flags())
            .finish()
    }
}

/// First frame of every fiber
extern "C" fn fiber_main(arg: usize) -> ! {
    // Safety: `arg` is the boxed fiber's address, set by `prepare`.
    let fiber = unsafe { &*(arg as *const Fiber) };
    let result = match fiber.body.take() {
        Some(body) => match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => result,
            Err(_) => weave_core::fatal!(
                "{} ({}) panicked; unwinding across a stack switch is not supported",
                fiber.id(),
                fiber.name().unwrap_or("unnamed")
            ),
        },
        None => Ok(0),
    };
    // Safety: a strand outlives every fiber it owns.
    let strand = unsafe { &*fiber.strand };
    strand.exit(result)
}
