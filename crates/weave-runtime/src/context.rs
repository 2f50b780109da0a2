//! Execution context
//!
//! One context per OS thread: it binds a [`Strand`], a [`Listener`], a
//! local memory cache and an inbound async-call ring to that thread. All
//! contexts of a runtime live in one [`Dispatcher`] and address each
//! other by index.
//!
//! Only the owning thread touches the strand, the listener and the cache.
//! Other threads reach a context through its call ring, its status word,
//! its parker and its remote-free queue.
//!
//! The master fiber drives [`Context::run`]:
//!
//! ```text
//!   loop until stopped:
//!     yield            run every ready fiber once
//!     handle_calls     drain the inbound ring
//!     idle? trim       release dead fibers and cache surplus
//!     poll             I/O, timers, forwarded events (blocks only when idle)
//!     request_tasks    nothing polled and nothing queued: ask the busiest peer
//!     distribute       too much queued: push a batch to the least loaded peer
//!     worker check     starved for a while: spawn a worker
//! ```

use std::cell::Cell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weave_core::constants::CALL_ARGS;
use weave_core::{
    kdebug, Canceled, FiberId, Ring, StatusWord, Task, TimerHandle, WeaveError, WeaveResult,
};

use crate::balance;
use crate::cache::{CacheBlock, LocalCache};
use crate::call::CallFrame;
use crate::config::RuntimeConfig;
use crate::dispatcher::Dispatcher;
use crate::fiber::FiberResult;
use crate::listener::{Listener, TimerAction};
use crate::parking::PlatformParker;
use crate::sink::{EventSink, SinkHandler};
use crate::backend::Interest;
use crate::strand::Strand;
use crate::tls::{self, TlsGuard};

/// Per-context counters, readable from any thread
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) tasks_executed: AtomicU64,
    pub(crate) calls: AtomicU64,
    pub(crate) polls: AtomicU64,
    pub(crate) events: AtomicU64,
    pub(crate) forwarded: AtomicU64,
    pub(crate) stolen: AtomicU64,
    pub(crate) distributed: AtomicU64,
    pub(crate) rounds: AtomicU64,
    pub(crate) first_distribute_round: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        let counters = Counters::default();
        counters.first_distribute_round.store(u64::MAX, Ordering::Relaxed);
        counters
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Snapshot of a context's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextStats {
    pub tasks_executed: u64,
    pub calls: u64,
    pub polls: u64,
    pub events: u64,
    pub forwarded: u64,
    pub stolen: u64,
    pub distributed: u64,
    pub rounds: u64,
    pub first_distribute_round: Option<u64>,
}

/// Address of a fiber anywhere in the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberRef {
    pub context: u32,
    pub fiber: FiberId,
}

pub struct Context {
    index: u32,
    dispatcher: *const Dispatcher,

    pub(crate) status: StatusWord,
    pub(crate) calls: Ring<CallFrame>,
    pub(crate) parker: PlatformParker,
    stop: AtomicBool,
    attached: AtomicBool,

    strand: Box<Strand>,
    pub(crate) listener: Listener,
    pub(crate) cache: LocalCache,

    pub(crate) requested: Cell<bool>,
    pub(crate) in_calls: Cell<bool>,
    workers_started: Cell<bool>,
    spins: Cell<u32>,
    idle_cycles: Cell<u32>,
    round: Cell<u64>,

    spin_limit: u32,
    poll_timeout: Duration,
    worker_spawn_cycles: u32,
    pub(crate) steal_batch: usize,
    pub(crate) distribute_threshold: usize,
    pub(crate) distribute_batch: usize,

    pub(crate) counters: Counters,
}

// Safety: the `Cell`s, the strand, the listener and the local half of the
// cache are only touched by the thread that attached the context (checked
// in debug builds). Everything reachable from other threads is atomic,
// the lock-free ring, the parker or the lock-free remote-free queue.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub(crate) fn new(index: u32, dispatcher: *const Dispatcher, config: &RuntimeConfig) -> Self {
        Context {
            index,
            dispatcher,
            status: StatusWord::new(),
            calls: Ring::with_capacity(config.async_queue_size),
            parker: PlatformParker::new(),
            stop: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            strand: Strand::new(config),
            listener: Listener::new(index, config),
            cache: LocalCache::new(index, config.cache_limit),
            requested: Cell::new(false),
            in_calls: Cell::new(false),
            workers_started: Cell::new(false),
            spins: Cell::new(0),
            idle_cycles: Cell::new(0),
            round: Cell::new(0),
            spin_limit: config.spin_limit,
            poll_timeout: config.poll_timeout,
            worker_spawn_cycles: config.worker_spawn_cycles.max(1),
            steal_batch: config.steal_batch,
            distribute_threshold: config.distribute_threshold,
            distribute_batch: config.distribute_batch,
            counters: Counters::new(),
        }
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn dispatcher(&self) -> &Dispatcher {
        // Safety: contexts live inside their dispatcher.
        unsafe { &*self.dispatcher }
    }

    /// The strand; owner thread only
    #[inline]
    pub fn strand(&self) -> &Strand {
        self.debug_assert_owner();
        &self.strand
    }

    #[inline]
    pub fn listener(&self) -> &Listener {
        self.debug_assert_owner();
        &self.listener
    }

    #[inline]
    pub fn status(&self) -> &StatusWord {
        &self.status
    }

    /// Every other context of the dispatcher
    pub fn peers(&self) -> impl Iterator<Item = &Context> + '_ {
        self.dispatcher().contexts().iter().filter(move |c| c.index != self.index)
    }

    /// Published task-list length (any thread)
    #[inline]
    pub fn task_count(&self) -> usize {
        self.strand.task_count()
    }

    /// True when nothing is queued and no fiber is waiting to run
    pub fn is_idle(&self) -> bool {
        self.strand.tasks_len() == 0 && self.strand.runnable() == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Scheduling rounds completed by the master
    pub fn round(&self) -> u64 {
        self.round.get()
    }

    pub fn stats(&self) -> ContextStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        ContextStats {
            tasks_executed: load(&c.tasks_executed),
            calls: load(&c.calls),
            polls: load(&c.polls),
            events: load(&c.events),
            forwarded: load(&c.forwarded),
            stolen: load(&c.stolen),
            distributed: load(&c.distributed),
            rounds: load(&c.rounds),
            first_distribute_round: match load(&c.first_distribute_round) {
                u64::MAX => None,
                round => Some(round),
            },
        }
    }

    #[inline]
    pub fn is_owner(&self) -> bool {
        tls::is_owner(self)
    }

    #[inline]
    pub(crate) fn debug_assert_owner(&self) {
        debug_assert!(
            self.is_owner() || !self.attached.load(Ordering::Relaxed),
            "context {} touched from a foreign thread",
            self.index
        );
    }

    // ---------------------------------------------------------------
    // Thread binding
    // ---------------------------------------------------------------

    /// Bind this context to the calling thread until the guard drops.
    ///
    /// The first attach starts `workers_min` workers.
    pub fn attach(&self) -> AttachGuard<'_> {
        if self.attached.swap(true, Ordering::AcqRel) {
            weave_core::fatal!("context {} attached twice", self.index);
        }
        let tls = tls::enter(&self.strand, Some(self));
        if !self.workers_started.replace(true) {
            self.strand.start_workers();
        }
        AttachGuard { ctx: self, _tls: tls }
    }

    /// Thread main: cycle until stopped, then shut the strand down
    pub fn run(&self) {
        let _attached = self.attach();
        kdebug!("context {} running, backend {}", self.index, self.dispatcher().backend().name());
        while !self.is_stopped() {
            self.cycle(true);
        }
        self.shutdown();
        kdebug!("context {} stopped after {} rounds", self.index, self.round.get());
    }

    /// Attach, run one non-blocking cycle and detach. Lets tests drive
    /// several contexts deterministically from one thread.
    pub fn step(&self) -> usize {
        let _attached = self.attach();
        self.cycle(false)
    }

    /// One master round; returns the amount of work observed
    fn cycle(&self, may_block: bool) -> usize {
        let strand = &*self.strand;
        let round = self.round.get() + 1;
        self.round.set(round);
        self.counters.rounds.store(round, Ordering::Relaxed);

        strand.yield_now();
        let mut work = self.handle_calls();

        let idle = self.is_idle();
        if idle {
            self.trim();
        }
        let timeout = if idle && may_block && self.spins.get() >= self.spin_limit {
            self.poll_timeout
        } else {
            Duration::ZERO
        };
        let polled = self.listener.poll(self, timeout);
        if polled > 0 {
            self.spins.set(0);
        } else {
            self.spins.set(self.spins.get().saturating_add(1));
        }
        work += polled + self.handle_calls();

        if polled == 0 && strand.tasks_len() == 0 {
            balance::request_tasks(self);
        }
        balance::distribute_tasks(self);
        self.check_workers();

        self.counters.tasks_executed.store(strand.stats().tasks_run, Ordering::Relaxed);
        work
    }

    fn check_workers(&self) {
        let strand = &*self.strand;
        if strand.tasks_len() > 0 && strand.idle_workers() == 0 {
            let cycles = self.idle_cycles.get() + 1;
            if cycles >= self.worker_spawn_cycles {
                self.idle_cycles.set(0);
                strand.spawn_worker();
            } else {
                self.idle_cycles.set(cycles);
            }
        } else {
            self.idle_cycles.set(0);
        }
    }

    /// Release dead fibers above the reuse limit and refill the cache
    /// from foreign frees
    pub fn trim(&self) {
        self.strand.trim();
        self.cache.trim();
    }

    fn shutdown(&self) {
        self.strand.shutdown();
        self.listener.shutdown(self);
        self.cache.trim();
    }

    /// Ask the context to leave its run loop (any thread)
    pub fn stop(&self) {
        self.call(stop_routine, [0; CALL_ARGS]);
    }

    // ---------------------------------------------------------------
    // Tasks and fibers
    // ---------------------------------------------------------------

    /// Queue a task on this context; owner only
    pub fn add_task(&self, task: Task) {
        self.strand().add_task(task);
    }

    /// Queue a task on this context from any thread
    pub fn send_task(&self, task: Task) {
        if self.is_owner() {
            self.add_task(task);
        } else {
            let [routine, arg] = task.to_words();
            self.call(receive_task, [routine, arg, 0, 0, 0, 0]);
        }
    }

    /// Make a blocked fiber of this context runnable (any thread)
    pub fn wake_fiber(&self, fiber: FiberId) {
        if self.is_owner() {
            self.strand.run(fiber);
        } else {
            self.call(wake_fiber, [fiber.to_word() as usize, 0, 0, 0, 0, 0]);
        }
    }

    /// Request cancellation of a fiber of this context (any thread)
    pub fn cancel_fiber(&self, fiber: FiberId) {
        if self.is_owner() {
            self.strand.cancel(fiber);
        } else {
            self.call(cancel_fiber, [fiber.to_word() as usize, 0, 0, 0, 0, 0]);
        }
    }

    /// Start a fiber on this context (any thread). From the owner the id
    /// is returned; a foreign spawn is asynchronous.
    pub fn spawn_fiber<F>(&self, body: F) -> Option<FiberRef>
    where
        F: FnOnce() -> FiberResult + Send + 'static,
    {
        if self.is_owner() {
            let fiber = self.strand.spawn(weave_core::Priority::DEFAULT, body);
            return Some(FiberRef { context: self.index, fiber });
        }
        let boxed: Box<Box<dyn FnOnce() -> FiberResult + Send>> = Box::new(Box::new(body));
        self.call(spawn_fiber, [Box::into_raw(boxed) as usize, 0, 0, 0, 0, 0]);
        None
    }

    /// Block the running fiber for `timeout`, or until woken earlier.
    pub fn pause(&self, timeout: Duration) -> Result<(), Canceled> {
        let strand = self.strand();
        strand.testcancel()?;
        let me = strand.current_id();
        let handle = self.listener.arm(Instant::now() + timeout, Duration::ZERO, TimerAction::Resume(me));
        strand.block();
        self.listener.disarm(handle);
        strand.testcancel()
    }

    // ---------------------------------------------------------------
    // Timers, sinks, cache
    // ---------------------------------------------------------------

    /// Arm a timer on this context; owner only
    pub fn arm_timer(
        &self,
        deadline: Instant,
        interval: Duration,
        action: TimerAction,
    ) -> WeaveResult<TimerHandle> {
        let refused = if !self.is_owner() {
            Some(WeaveError::WrongContext)
        } else if matches!(action, TimerAction::Task(task) if !interval.is_zero() && task.is_boxed()) {
            Some(WeaveError::InvalidState)
        } else {
            None
        };
        if let Some(err) = refused {
            if let TimerAction::Task(task) = action {
                task.discard();
            }
            return Err(err);
        }
        Ok(self.listener.arm(deadline, interval, action))
    }

    pub fn disarm_timer(&self, handle: TimerHandle) -> bool {
        self.is_owner() && self.listener.disarm(handle)
    }

    /// Register `fd` with this context as its owner
    pub fn register_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        pinned: bool,
        handler: Option<Arc<dyn SinkHandler>>,
    ) -> WeaveResult<Arc<EventSink>> {
        self.dispatcher().register(self.index, fd, interest, pinned, handler)
    }

    /// Take a block of at least `size` bytes from this context's cache
    pub fn alloc(&self, size: usize) -> CacheBlock {
        self.debug_assert_owner();
        self.cache.alloc(size)
    }

    /// Return a block. Foreign blocks go back to their owner's queue.
    pub fn free(&self, block: CacheBlock) {
        if block.owner() == self.index && self.is_owner() {
            self.cache.free_local(block);
        } else {
            self.dispatcher().context(block.owner()).cache.free_remote(block);
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("index", &self.index)
            .field("status", &self.status)
            .field("task_count", &self.task_count())
            .finish()
    }
}

/// Keeps a context bound to the current thread
pub struct AttachGuard<'a> {
    ctx: &'a Context,
    _tls: TlsGuard,
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        self.ctx.attached.store(false, Ordering::Release);
    }
}

// -------------------------------------------------------------------
// Call routines
// -------------------------------------------------------------------

fn stop_routine(ctx: &Context, _args: &[usize; CALL_ARGS]) {
    ctx.stop.store(true, Ordering::Release);
}

pub(crate) fn receive_task(ctx: &Context, args: &[usize; CALL_ARGS]) {
    // Safety: the words come from `Task::to_words` of a task that left
    // its previous list.
    let task = unsafe { Task::from_words([args[0], args[1]]) };
    ctx.strand.add_task(task);
}

pub(crate) fn wake_fiber(ctx: &Context, args: &[usize; CALL_ARGS]) {
    ctx.strand.run(FiberId::from_word(args[0] as u64));
}

fn cancel_fiber(ctx: &Context, args: &[usize; CALL_ARGS]) {
    ctx.strand.cancel(FiberId::from_word(args[0] as u64));
}

fn spawn_fiber(ctx: &Context, args: &[usize; CALL_ARGS]) {
    // Safety: produced by `Context::spawn_fiber` and consumed once.
    let body = unsafe { Box::from_raw(args[0] as *mut Box<dyn FnOnce() -> FiberResult + Send>) };
    ctx.strand.spawn(weave_core::Priority::DEFAULT, move || body());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn dispatcher(contexts: usize) -> Arc<Dispatcher> {
        let config = RuntimeConfig::new()
            .contexts(contexts)
            .stack_size(64 * 1024)
            .workers_min(1)
            .workers_max(4)
            .spin_limit(0);
        Dispatcher::new(config).unwrap()
    }

    #[test]
    fn test_step_runs_local_tasks() {
        let d = dispatcher(1);
        let ctx = d.context(0);
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let _a = ctx.attach();
            for _ in 0..10 {
                let h = hits.clone();
                ctx.add_task(Task::boxed(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        for _ in 0..10 {
            ctx.step();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(ctx.stats().tasks_executed, 10);
        assert!(ctx.stats().rounds >= 10);
    }

    #[test]
    fn test_send_task_and_wake_cross_context() {
        let d = dispatcher(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        // Sent from off-runtime: goes through the ring.
        d.context(1).send_task(Task::boxed(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        for _ in 0..4 {
            d.context(1).step();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(d.context(1).stats().calls >= 1);
    }

    #[test]
    fn test_spawn_fiber_and_pause() {
        let d = dispatcher(1);
        let ctx = d.context(0);
        let stage = Arc::new(AtomicUsize::new(0));
        let s = stage.clone();
        ctx.spawn_fiber(move || {
            let ctx = tls::context().unwrap();
            s.store(1, Ordering::SeqCst);
            ctx.pause(Duration::from_millis(5))?;
            s.store(2, Ordering::SeqCst);
            Ok(0)
        });
        // First step spawns through the ring, second one runs the fiber.
        ctx.step();
        ctx.step();
        assert!(stage.load(Ordering::SeqCst) >= 1);
        let deadline = Instant::now() + Duration::from_secs(5);
        while stage.load(Ordering::SeqCst) != 2 && Instant::now() < deadline {
            ctx.step();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(stage.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_wakes_paused_fiber() {
        let d = dispatcher(1);
        let ctx = d.context(0);
        let result = Arc::new(AtomicUsize::new(0));
        let r = result.clone();
        let fiber = {
            let _a = ctx.attach();
            ctx.spawn_fiber(move || {
                let ctx = tls::context().unwrap();
                let outcome = ctx.pause(Duration::from_secs(60));
                r.store(if outcome.is_err() { 1 } else { 2 }, Ordering::SeqCst);
                outcome.map(|_| 0)
            })
            .unwrap()
        };
        ctx.step();
        // Off-runtime cancel goes through the ring.
        d.context(fiber.context).cancel_fiber(fiber.fiber);
        for _ in 0..4 {
            ctx.step();
        }
        assert_eq!(result.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_boxed_timer_refused() {
        let d = dispatcher(1);
        let ctx = d.context(0);
        let _a = ctx.attach();
        let err = ctx
            .arm_timer(Instant::now(), Duration::from_millis(1), TimerAction::Task(Task::boxed(|| {})))
            .unwrap_err();
        assert_eq!(err, WeaveError::InvalidState);
        drop(_a);
        assert_eq!(
            ctx.arm_timer(Instant::now(), Duration::ZERO, TimerAction::Resume(FiberId::NONE)),
            Err(WeaveError::WrongContext)
        );
    }

    #[test]
    fn test_refused_timer_task_is_released() {
        let d = dispatcher(1);
        let ctx = d.context(0);
        let witness = Arc::new(());
        let w = witness.clone();
        let periodic = Task::boxed(move || {
            let _ = &w;
        });
        {
            let _a = ctx.attach();
            let err = ctx.arm_timer(Instant::now(), Duration::from_millis(5), TimerAction::Task(periodic));
            assert_eq!(err, Err(WeaveError::InvalidState));
        }
        assert_eq!(Arc::strong_count(&witness), 1);

        let w = witness.clone();
        let foreign = Task::boxed(move || {
            let _ = &w;
        });
        let err = ctx.arm_timer(Instant::now(), Duration::ZERO, TimerAction::Task(foreign));
        assert_eq!(err, Err(WeaveError::WrongContext));
        assert_eq!(Arc::strong_count(&witness), 1);
    }

    #[test]
    fn test_stop_via_call() {
        let d = dispatcher(1);
        let ctx = d.context(0);
        assert!(!ctx.is_stopped());
        ctx.stop();
        ctx.step();
        assert!(ctx.is_stopped());
    }
}
