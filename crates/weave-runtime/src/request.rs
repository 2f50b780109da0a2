//! Async syscall: run a routine on another context and wait for its result
//!
//! The request node lives on the caller's stack. The target writes the
//! result, flips the node to `DONE` with release ordering and then wakes
//! the caller through a plain async call back to the caller's context.
//! The caller stays blocked (with cancellation held off) until it sees
//! `DONE`, so the node never dies while the target still writes to it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

use weave_core::constants::{CALL_ARGS, CONTEXT_NONE};
use weave_core::{FiberId, WeaveError, WeaveResult};

use crate::context::{self, Context};
use crate::tls;

/// Routine run on the target; its return value goes back to the caller
pub type RequestRoutine = fn(&Context, &[usize; 4]) -> usize;

const DEFERRED: u8 = 0;
const DONE: u8 = 1;

struct RequestNode {
    state: AtomicU8,
    result: UnsafeCell<usize>,
    origin: u32,
    fiber: FiberId,
}

impl Context {
    /// Run `routine(args)` on this context and return its result to the
    /// caller.
    ///
    /// A fiber caller blocks; the master or a foreign thread keeps
    /// serving its own calls while it waits. Cancellation is deferred for
    /// the duration so the request node outlives the reply.
    pub fn request(&self, routine: RequestRoutine, args: [usize; 4]) -> WeaveResult<usize> {
        let caller = tls::context();
        if let Some(me) = caller {
            if core::ptr::eq(me, self) {
                return Ok(routine(self, &args));
            }
        }

        let blocking = caller.filter(|me| !me.strand().in_master());
        let node = RequestNode {
            state: AtomicU8::new(DEFERRED),
            result: UnsafeCell::new(0),
            origin: blocking.map_or(CONTEXT_NONE, |me| me.index()),
            fiber: blocking.map_or(FiberId::NONE, |me| me.strand().current_id()),
        };
        let frame = [
            &node as *const RequestNode as usize,
            routine as usize,
            args[0],
            args[1],
            args[2],
            args[3],
        ];

        match blocking {
            Some(me) => {
                let strand = me.strand();
                let was_enabled = strand.set_cancel_enabled(false);
                self.call(serve_request, frame);
                while node.state.load(Ordering::Acquire) == DEFERRED {
                    strand.block();
                }
                strand.set_cancel_enabled(was_enabled);
            }
            None => {
                self.call(serve_request, frame);
                while node.state.load(Ordering::Acquire) == DEFERRED {
                    if let Some(me) = caller {
                        me.handle_calls();
                    }
                    std::thread::yield_now();
                }
            }
        }
        // Safety: DONE was published after the last write.
        Ok(unsafe { *node.result.get() })
    }
}

fn serve_request(ctx: &Context, args: &[usize; CALL_ARGS]) {
    // Safety: the node is pinned on the caller's stack until DONE.
    let node = unsafe { &*(args[0] as *const RequestNode) };
    // Safety: the word was produced from a `RequestRoutine`.
    let routine: RequestRoutine = unsafe { core::mem::transmute::<usize, RequestRoutine>(args[1]) };
    let result = routine(ctx, &[args[2], args[3], args[4], args[5]]);

    let origin = node.origin;
    let fiber = node.fiber;
    // Safety: exclusive until DONE is stored.
    unsafe { *node.result.get() = result };
    node.state.store(DONE, Ordering::Release);
    // The node may be gone from here on.

    if origin != CONTEXT_NONE {
        let target = ctx.dispatcher().context(origin);
        target.call(context::wake_fiber, [fiber.to_word() as usize, 0, 0, 0, 0, 0]);
    }
}

/// [`Context::request`] on the context at `index` of the caller's runtime
pub fn request(index: u32, routine: RequestRoutine, args: [usize; 4]) -> WeaveResult<usize> {
    let me = tls::context().ok_or(WeaveError::NotOnContext)?;
    if index as usize >= me.dispatcher().len() {
        return Err(WeaveError::WrongContext);
    }
    me.dispatcher().context(index).request(routine, args)
}
