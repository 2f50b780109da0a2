//! Free-function API
//!
//! Every function resolves "my context" through the thread-local set at
//! attach and fails with [`WeaveError::NotOnContext`] off-runtime.
//! Operations that suspend the caller also refuse to run on the master
//! fiber, which must never block.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use weave_core::{FiberId, Priority, Task, TimerHandle, WeaveError, WeaveResult};

use crate::backend::Interest;
use crate::cache::CacheBlock;
use crate::context::{self, Context, FiberRef};
use crate::fiber::FiberResult;
use crate::listener::TimerAction;
use crate::sink::{EventSink, SinkHandler};
use crate::tls;

pub use crate::call::{
    call_0, call_1, call_2, call_3, call_4, call_5, call_6, post_0, post_1, post_2, post_3, post_4,
    post_5, post_6, trycall_0, trycall_1, trycall_2, trycall_3, trycall_4, trycall_5, trycall_6,
    CallRoutine,
};
pub use crate::request::{request, RequestRoutine};

/// The calling thread's context
#[inline]
pub fn context_selfptr() -> Option<&'static Context> {
    tls::context()
}

fn me() -> WeaveResult<&'static Context> {
    tls::context().ok_or(WeaveError::NotOnContext)
}

fn me_suspendable() -> WeaveResult<&'static Context> {
    let ctx = me()?;
    if ctx.strand().in_master() {
        return Err(WeaveError::InvalidState);
    }
    Ok(ctx)
}

// -------------------------------------------------------------------
// Fibers
// -------------------------------------------------------------------

/// Create a runnable fiber on the calling context
pub fn fiber_create<F>(priority: Priority, stack_size: usize, body: F) -> WeaveResult<FiberRef>
where
    F: FnOnce() -> FiberResult + 'static,
{
    let ctx = me()?;
    let fiber = ctx.strand().create(priority, stack_size, body);
    Ok(FiberRef { context: ctx.index(), fiber })
}

/// Create a fiber with default priority and stack size
pub fn fiber_spawn<F>(body: F) -> WeaveResult<FiberRef>
where
    F: FnOnce() -> FiberResult + 'static,
{
    let ctx = me()?;
    let fiber = ctx.strand().spawn(Priority::DEFAULT, body);
    Ok(FiberRef { context: ctx.index(), fiber })
}

/// Make a blocked fiber runnable, on whichever context owns it
pub fn fiber_run(fiber: FiberRef) -> WeaveResult<()> {
    let ctx = me()?;
    target(ctx, fiber.context)?.wake_fiber(fiber.fiber);
    Ok(())
}

pub fn fiber_yield() -> WeaveResult<()> {
    me()?.strand().yield_now();
    Ok(())
}

/// Block until another party runs this fiber again
pub fn fiber_block() -> WeaveResult<()> {
    me_suspendable()?.strand().block();
    Ok(())
}

pub fn fiber_pause(timeout: Duration) -> WeaveResult<()> {
    me_suspendable()?.pause(timeout)?;
    Ok(())
}

/// Finish the running fiber. Off-runtime or on the master this aborts.
pub fn fiber_exit(result: FiberResult) -> ! {
    match tls::strand() {
        Some(strand) => strand.exit(result),
        None => weave_core::fatal!("fiber_exit called off-runtime"),
    }
}

pub fn fiber_self() -> WeaveResult<FiberRef> {
    let ctx = me()?;
    Ok(FiberRef { context: ctx.index(), fiber: ctx.strand().current_id() })
}

/// Cancellation point
pub fn fiber_testcancel() -> WeaveResult<()> {
    me()?.strand().testcancel()?;
    Ok(())
}

pub fn fiber_cancel(fiber: FiberRef) -> WeaveResult<()> {
    let ctx = me()?;
    target(ctx, fiber.context)?.cancel_fiber(fiber.fiber);
    Ok(())
}

/// Raise the priority of a local fiber until it next gives up control
pub fn fiber_hoist(fiber: FiberId, priority: Priority) -> WeaveResult<bool> {
    Ok(me()?.strand().hoist(fiber, priority))
}

/// Wait for a local fiber to finish
pub fn fiber_join(fiber: FiberId) -> WeaveResult<FiberResult> {
    me_suspendable()?.strand().join(fiber).ok_or(WeaveError::InvalidFiber)
}

fn target(ctx: &Context, index: u32) -> WeaveResult<&Context> {
    if index as usize >= ctx.dispatcher().len() {
        return Err(WeaveError::WrongContext);
    }
    Ok(ctx.dispatcher().context(index))
}

// -------------------------------------------------------------------
// Tasks
// -------------------------------------------------------------------

pub fn context_add_task(task: Task) -> WeaveResult<()> {
    me()?.add_task(task);
    Ok(())
}

pub fn context_send_task(index: u32, task: Task) -> WeaveResult<()> {
    let ctx = me()?;
    target(ctx, index)?.send_task(task);
    Ok(())
}

/// Queue a task on any peer that is not running, or locally
pub fn context_post_task(task: Task) -> WeaveResult<()> {
    let [routine, arg] = task.to_words();
    me()?.post(context::receive_task, [routine, arg, 0, 0, 0, 0]);
    Ok(())
}

// -------------------------------------------------------------------
// Events and timers
// -------------------------------------------------------------------

/// Register `fd` with the calling context; the sink takes ownership of it
pub fn event_register_fd(
    fd: RawFd,
    interest: Interest,
    pinned: bool,
    handler: Option<Arc<dyn SinkHandler>>,
) -> WeaveResult<Arc<EventSink>> {
    me()?.register_fd(fd, interest, pinned, handler)
}

pub fn event_close_fd(sink: &EventSink) {
    sink.close();
}

pub fn event_arm_timer(deadline: Instant, interval: Duration, action: TimerAction) -> WeaveResult<TimerHandle> {
    me()?.arm_timer(deadline, interval, action)
}

pub fn event_disarm_timer(handle: TimerHandle) -> WeaveResult<bool> {
    Ok(me()?.disarm_timer(handle))
}

// -------------------------------------------------------------------
// Cache
// -------------------------------------------------------------------

pub fn cache_alloc(size: usize) -> WeaveResult<CacheBlock> {
    Ok(me()?.alloc(size))
}

/// Return a block; works from any context
pub fn cache_free(block: CacheBlock) -> WeaveResult<()> {
    me()?.free(block);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::dispatcher::Dispatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_off_runtime_is_rejected() {
        assert!(context_selfptr().is_none());
        assert_eq!(fiber_yield(), Err(WeaveError::NotOnContext));
        assert_eq!(context_add_task(Task::boxed(|| {})).unwrap_err(), WeaveError::NotOnContext);
        assert_eq!(cache_alloc(8).unwrap_err(), WeaveError::NotOnContext);
    }

    #[test]
    fn test_master_cannot_suspend() {
        let d = Dispatcher::new(RuntimeConfig::new().contexts(1).workers_min(0)).unwrap();
        let _a = d.context(0).attach();
        assert_eq!(fiber_block(), Err(WeaveError::InvalidState));
        assert_eq!(fiber_pause(Duration::from_millis(1)), Err(WeaveError::InvalidState));
        assert!(context_selfptr().is_some());
    }

    #[test]
    fn test_fiber_join_and_cancel_through_api() {
        let d = Dispatcher::new(RuntimeConfig::new().contexts(2).workers_min(0).stack_size(64 * 1024)).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        {
            let _a = d.context(0).attach();
            fiber_spawn(move || {
                let sleeper = fiber_spawn(|| {
                    fiber_pause(Duration::from_secs(60)).map_err(|_| weave_core::Canceled)?;
                    Ok(1)
                })
                .unwrap();
                fiber_yield().unwrap();
                fiber_cancel(sleeper).unwrap();
                let outcome = fiber_join(sleeper.fiber).unwrap();
                s.store(if outcome.is_err() { 2 } else { 1 }, Ordering::SeqCst);
                Ok(0)
            })
            .unwrap();
        }
        for _ in 0..10 {
            d.context(0).step();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_send_task_to_out_of_range_context() {
        let d = Dispatcher::new(RuntimeConfig::new().contexts(1).workers_min(0)).unwrap();
        let _a = d.context(0).attach();
        let task = Task::boxed(|| {});
        assert_eq!(context_send_task(3, task), Err(WeaveError::WrongContext));
        // Not queued anywhere; release it.
        task.discard();
    }
}
