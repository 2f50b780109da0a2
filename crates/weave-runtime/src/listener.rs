//! Per-context listener
//!
//! Every context owns a listener, but all listeners of a dispatcher share
//! one I/O backend. Whoever wins the dispatcher's poll lock becomes the
//! poller for that round:
//!
//! ```text
//!   winner                                  loser
//!   publish Polling|Pending @ ring head     publish Waiting @ ring head
//!   re-check ring, clip wait to timers      re-check ring, clip to timers
//!   enter epoch, backend.poll               park on the context parker
//!   running, release lock
//!   own sinks: handle now
//!   other sinks: pack `ptr | bits` words,
//!     six per call to the owner
//!   leave epoch
//! ```
//!
//! Afterwards both run their expired timers, try to advance the epoch and
//! free sinks whose retirement epoch is safe.
//!
//! A sink reported by the backend is touched only inside the poller's
//! epoch section or after its `dispatched` counter was raised there, so a
//! retired sink stays alive until both the epoch moved on twice and every
//! dispatched event completed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use weave_core::constants::{CALL_ARGS, FORWARD_BATCH};
use weave_core::{kerror, ktrace, ContextState, FiberId, RetireList, Task, TimerHandle, TimerQueue};

use crate::backend::{self, BackendEvent};
use crate::config::RuntimeConfig;
use crate::context::{Context, Counters};
use crate::parking::ContextParking;
use crate::sink::{self, EventSink};

/// What a timer does when it fires
#[derive(Debug, Clone, Copy)]
pub enum TimerAction {
    /// Make a blocked fiber of the owning context runnable
    Resume(FiberId),
    /// Queue a task on the owning context
    Task(Task),
}

pub struct Listener {
    index: u32,
    timers: RefCell<TimerQueue<TimerAction>>,
    /// One-shot boxed tasks still armed; discarded on disarm
    boxed: RefCell<HashMap<TimerHandle, Task>>,
    retired: RefCell<RetireList<usize>>,
    events: RefCell<Vec<BackendEvent>>,
    /// Pending forward words per target context
    forwards: RefCell<Vec<Vec<usize>>>,
}

impl Listener {
    pub fn new(index: u32, config: &RuntimeConfig) -> Self {
        Listener {
            index,
            timers: RefCell::new(TimerQueue::new(config.timer_buckets, config.timer_resolution)),
            boxed: RefCell::new(HashMap::new()),
            retired: RefCell::new(RetireList::new()),
            events: RefCell::new(Vec::with_capacity(64)),
            forwards: RefCell::new(vec![Vec::with_capacity(FORWARD_BATCH); config.contexts]),
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Arm a timer. Periodic timers must not carry boxed tasks; the
    /// context checks that before calling here.
    pub fn arm(&self, deadline: Instant, interval: Duration, action: TimerAction) -> TimerHandle {
        let handle = self.timers.borrow_mut().arm(deadline, interval, action);
        if let TimerAction::Task(task) = action {
            if task.is_boxed() {
                self.boxed.borrow_mut().insert(handle, task);
            }
        }
        handle
    }

    /// Cancel an armed timer. Returns false if it already fired or was
    /// cancelled before.
    pub fn disarm(&self, handle: TimerHandle) -> bool {
        let cancelled = self.timers.borrow_mut().disarm(handle);
        if let Some(task) = self.boxed.borrow_mut().remove(&handle) {
            task.discard();
        }
        cancelled
    }

    /// Timers armed (cancelled ones included until swept)
    pub fn timers_armed(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Queue a sink token for reclamation once the epoch allows it
    pub fn retire(&self, ctx: &Context, token: usize) {
        self.retired.borrow_mut().retire(ctx.dispatcher().epoch(), token);
    }

    pub fn retired_pending(&self) -> usize {
        self.retired.borrow().len()
    }

    /// One listener round. Blocks up to `timeout` when the ring is empty
    /// and no timer is due sooner. Returns events, forwarded events and
    /// timers handled.
    pub fn poll(&self, ctx: &Context, timeout: Duration) -> usize {
        let d = ctx.dispatcher();
        let timeout = self.clip_to_timers(timeout);
        let mut work = 0;

        match d.poll_lock().try_lock() {
            Some(guard) => {
                let state = if timeout.is_zero() { ContextState::Pending } else { ContextState::Polling };
                ctx.status.publish(state, ctx.calls.dequeue_stamp());
                let wait = if ctx.calls.has_ready() { Duration::ZERO } else { timeout };

                let mut events = self.events.borrow_mut();
                events.clear();
                d.epoch().enter(self.index as usize);
                let polled = match d.backend().poll(&mut events, Some(wait)) {
                    Ok(n) => n,
                    Err(e) => {
                        kerror!("listener {}: backend poll failed: {}", self.index, e);
                        0
                    }
                };
                ctx.status.set_running();
                drop(guard);

                for event in events.drain(..) {
                    self.dispatch(ctx, event);
                }
                self.flush_forwards(ctx);
                d.epoch().leave(self.index as usize);

                Counters::add(&ctx.counters.polls, 1);
                Counters::add(&ctx.counters.events, polled as u64);
                work += polled;
            }
            None => {
                if !timeout.is_zero() {
                    ctx.status.publish(ContextState::Waiting, ctx.calls.dequeue_stamp());
                    if !ctx.calls.has_ready() {
                        ctx.parker.park(Some(timeout));
                    }
                    ctx.status.set_running();
                }
            }
        }

        work += self.expire(ctx);
        d.epoch().try_advance();
        self.reclaim(ctx);
        work
    }

    fn clip_to_timers(&self, timeout: Duration) -> Duration {
        if timeout.is_zero() {
            return timeout;
        }
        match self.timers.borrow().next_deadline() {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        }
    }

    fn dispatch(&self, ctx: &Context, event: BackendEvent) {
        // Safety: the token is a registered sink and we are inside our
        // epoch section.
        let sink = unsafe { &*(event.token as *const EventSink) };
        sink.note_dispatched();
        let owner = sink.owner();
        if owner == self.index {
            sink.on_events(ctx, event.bits);
            return;
        }
        let full = {
            let mut forwards = self.forwards.borrow_mut();
            let batch = &mut forwards[owner as usize];
            batch.push(event.token | (event.bits & backend::bits::MASK));
            batch.len() == FORWARD_BATCH
        };
        if full {
            self.flush_to(ctx, owner);
        }
    }

    fn flush_forwards(&self, ctx: &Context) {
        for target in 0..ctx.dispatcher().len() as u32 {
            self.flush_to(ctx, target);
        }
    }

    fn flush_to(&self, ctx: &Context, target: u32) {
        let mut args = [0usize; CALL_ARGS];
        let n = {
            let mut forwards = self.forwards.borrow_mut();
            let batch = &mut forwards[target as usize];
            let n = batch.len();
            args[..n].copy_from_slice(batch);
            batch.clear();
            n
        };
        if n == 0 {
            return;
        }
        ktrace!("listener {} forwards {} events to {}", self.index, n, target);
        Counters::add(&ctx.counters.forwarded, n as u64);
        ctx.dispatcher().context(target).call(sink::handle_forwarded, args);
    }

    fn expire(&self, ctx: &Context) -> usize {
        let mut due = Vec::new();
        let fired = self.timers.borrow_mut().expire(Instant::now(), |handle, action| {
            due.push((handle, *action));
        });
        for (handle, action) in due {
            match action {
                TimerAction::Resume(fiber) => {
                    ctx.strand().run(fiber);
                }
                TimerAction::Task(task) => {
                    if task.is_boxed() {
                        self.boxed.borrow_mut().remove(&handle);
                    }
                    ctx.add_task(task);
                }
            }
        }
        fired
    }

    /// Free retired sinks whose epoch is safe; busy ones are retired again
    fn reclaim(&self, ctx: &Context) -> usize {
        let d = ctx.dispatcher();
        let mut safe = Vec::new();
        let n = self.retired.borrow_mut().reclaim(d.epoch(), |token| safe.push(token));
        for token in safe {
            if !d.free_sink(token) {
                self.retire(ctx, token);
            }
        }
        n
    }

    /// Drop timers and hand every retired sink back to the dispatcher
    pub fn shutdown(&self, ctx: &Context) {
        self.timers.borrow_mut().drain();
        for (_, task) in self.boxed.borrow_mut().drain() {
            task.discard();
        }
        let tokens: Vec<usize> = self.retired.borrow_mut().drain_all().collect();
        for token in tokens {
            ctx.dispatcher().free_sink(token);
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("index", &self.index)
            .field("timers", &self.timers.borrow().len())
            .field("retired", &self.retired.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn dispatcher(contexts: usize) -> Arc<Dispatcher> {
        Dispatcher::new(
            RuntimeConfig::new()
                .contexts(contexts)
                .workers_min(1)
                .stack_size(64 * 1024)
                .timer_resolution(Duration::from_millis(1)),
        )
        .unwrap()
    }

    #[test]
    fn test_task_timer_fires_once() {
        let d = dispatcher(1);
        let ctx = d.context(0);
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let _a = ctx.attach();
            let h = hits.clone();
            ctx.arm_timer(
                Instant::now() + Duration::from_millis(2),
                Duration::ZERO,
                TimerAction::Task(Task::boxed(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            ctx.step();
        }
        for _ in 0..10 {
            ctx.step();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let _a = ctx.attach();
        assert!(ctx.listener().boxed.borrow().is_empty());
    }

    #[test]
    fn test_disarmed_boxed_task_is_discarded() {
        let d = dispatcher(1);
        let ctx = d.context(0);
        let witness = Arc::new(());
        let _a = ctx.attach();
        let w = witness.clone();
        let handle = ctx
            .arm_timer(
                Instant::now() + Duration::from_secs(60),
                Duration::ZERO,
                TimerAction::Task(Task::boxed(move || drop(w))),
            )
            .unwrap();
        assert_eq!(Arc::strong_count(&witness), 2);
        assert!(ctx.disarm_timer(handle));
        assert_eq!(Arc::strong_count(&witness), 1);
    }

    /// A waiting context sleeps no longer than its next timer
    #[test]
    fn test_blocking_poll_clipped_to_timer() {
        let d = dispatcher(1);
        let ctx = d.context(0);
        let _a = ctx.attach();
        ctx.listener()
            .arm(Instant::now() + Duration::from_millis(20), Duration::ZERO, TimerAction::Resume(FiberId::NONE));
        let start = Instant::now();
        ctx.listener().poll(ctx, Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    /// Only one context polls the backend; the other parks and is woken
    /// by a call
    #[test]
    fn test_loser_parks_until_called() {
        let d = dispatcher(2);
        let _held = d.poll_lock().lock();
        let sleeper = {
            let d = d.clone();
            std::thread::spawn(move || {
                let ctx = d.context(1);
                let _a = ctx.attach();
                let start = Instant::now();
                ctx.listener().poll(ctx, Duration::from_secs(10));
                start.elapsed()
            })
        };
        while d.context(1).status().state() != ContextState::Waiting {
            std::thread::yield_now();
        }
        fn nothing(_: &Context, _: &[usize; CALL_ARGS]) {}
        d.context(1).call(nothing, [0; CALL_ARGS]);
        assert!(sleeper.join().unwrap() < Duration::from_secs(5));
    }
}
