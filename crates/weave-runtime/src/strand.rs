//! Per-thread cooperative fiber scheduler
//!
//! A strand owns every fiber of one OS thread: the run queue, the idle
//! worker queue, the blocked set, the dead list (for stack reuse), the
//! master fiber, the worker pool and the local task list.
//!
//! ```text
//!               create                 run(id)
//!   (dead) ----------------> Pending <----------- Blocked
//!     ^                      |    ^                  ^
//!     |                 get  v    | yield_now        | block / park_idle
//!     +---- exit ------- Running -+------------------+
//! ```
//!
//! Exactly one fiber is `Running`. Every other live fiber sits in exactly
//! one of the run queue, the idle queue or the blocked set. The master
//! fiber runs on the thread's own stack and only ever yields, so it is
//! always runnable whenever another fiber gives up control.
//!
//! Nothing here is thread-safe; the only shared piece is the published
//! task count that peers read when balancing.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use weave_core::{
    kdebug, ktrace, kwarn, CachePadded, Canceled, FiberFlags, FiberId, FiberState, Priority,
    RunQueue, Task, TaskList,
};

use crate::arch::Continuation;
use crate::config::RuntimeConfig;
use crate::fiber::{Fiber, FiberResult};
use crate::memory::Stack;
use crate::tls::{self, TlsGuard};

/// Rounds the master yields while waiting for fibers to honour a
/// shutdown cancel
const SHUTDOWN_ROUNDS: usize = 1024;

struct Slot {
    fiber: Option<Box<Fiber>>,
    generation: u32,
}

/// Counters kept by a strand
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StrandStats {
    pub fibers_created: u64,
    pub stacks_allocated: u64,
    pub stacks_reused: u64,
    pub stacks_released: u64,
    pub switches: u64,
    pub tasks_run: u64,
    pub workers_spawned: u64,
}

/// Snapshot of where every fiber currently is
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Census {
    /// Live fibers, including the master
    pub live: usize,
    pub runnable: usize,
    pub idle: usize,
    pub blocked: usize,
    pub dead: usize,
    pub workers: usize,
}

pub struct Strand {
    stack_size: usize,
    workers_min: usize,
    workers_max: usize,
    worker_yield_interval: u32,
    dead_fiber_limit: usize,

    slots: RefCell<Vec<Slot>>,
    free_slots: RefCell<Vec<u32>>,
    runq: RefCell<RunQueue<FiberId>>,
    idle: RefCell<VecDeque<FiberId>>,
    blocked: RefCell<HashSet<FiberId>>,
    dead: RefCell<VecDeque<u32>>,
    current: Cell<*const Fiber>,
    master: Cell<*const Fiber>,

    tasks: RefCell<TaskList>,
    task_count: CachePadded<AtomicUsize>,

    workers: Cell<usize>,
    limit_warned: Cell<bool>,
    stopping: Cell<bool>,
    stats: Cell<StrandStats>,
}

impl Strand {
    /// Build a strand whose master fiber is whatever code first enters it
    pub fn new(config: &RuntimeConfig) -> Box<Strand> {
        let strand = Box::new(Strand {
            stack_size: config.stack_size,
            workers_min: config.workers_min,
            workers_max: config.workers_max,
            worker_yield_interval: config.worker_yield_interval.max(1),
            dead_fiber_limit: config.dead_fiber_limit,
            slots: RefCell::new(Vec::new()),
            free_slots: RefCell::new(Vec::new()),
            runq: RefCell::new(RunQueue::new()),
            idle: RefCell::new(VecDeque::new()),
            blocked: RefCell::new(HashSet::new()),
            dead: RefCell::new(VecDeque::new()),
            current: Cell::new(ptr::null()),
            master: Cell::new(ptr::null()),
            tasks: RefCell::new(TaskList::new()),
            task_count: CachePadded::new(AtomicUsize::new(0)),
            workers: Cell::new(0),
            limit_warned: Cell::new(false),
            stopping: Cell::new(false),
            stats: Cell::new(StrandStats::default()),
        });

        let master = Box::new(Fiber::new(FiberId::new(0, 0), None, &*strand));
        master.state.set(FiberState::Running);
        master.name.set(Some("master"));
        master.base_priority.set(Priority::MASTER);
        master.priority.set(Priority::MASTER);
        let master_ptr: *const Fiber = &*master;
        strand.slots.borrow_mut().push(Slot { fiber: Some(master), generation: 0 });
        strand.current.set(master_ptr);
        strand.master.set(master_ptr);
        strand
    }

    /// Make this strand current on the calling thread (no context)
    pub fn enter(&self) -> TlsGuard {
        tls::enter(self, None)
    }

    fn update_stats(&self, f: impl FnOnce(&mut StrandStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    pub fn stats(&self) -> StrandStats {
        self.stats.get()
    }

    // ---------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------

    /// The running fiber
    #[inline]
    pub fn current(&self) -> &Fiber {
        // Safety: always points at a boxed fiber owned by this strand.
        unsafe { &*self.current.get() }
    }

    #[inline]
    pub fn current_id(&self) -> FiberId {
        self.current().id()
    }

    #[inline]
    pub fn master(&self) -> &Fiber {
        unsafe { &*self.master.get() }
    }

    #[inline]
    pub fn in_master(&self) -> bool {
        ptr::eq(self.current.get(), self.master.get())
    }

    fn slot_fiber(&self, index: u32) -> Option<&Fiber> {
        let slots = self.slots.borrow();
        let fiber: *const Fiber = &**slots.get(index as usize)?.fiber.as_ref()?;
        drop(slots);
        // Safety: boxes are only dropped by `trim` and `destroy`, which
        // never release a fiber that is still referenced.
        Some(unsafe { &*fiber })
    }

    /// A live fiber by id; `None` when stale or dead
    pub fn fiber(&self, id: FiberId) -> Option<&Fiber> {
        if id.is_none() {
            return None;
        }
        self.slot_fiber(id.index())
            .filter(|f| f.id() == id && f.state() != FiberState::Invalid)
    }

    // ---------------------------------------------------------------
    // Creation
    // ---------------------------------------------------------------

    /// Create a fiber at `priority` with the strand's default stack size
    pub fn spawn<F>(&self, priority: Priority, body: F) -> FiberId
    where
        F: FnOnce() -> FiberResult + 'static,
    {
        self.create(priority, self.stack_size, body)
    }

    /// Create a fiber and make it runnable.
    ///
    /// A dead fiber whose stack has the same usable size is recycled;
    /// otherwise a fresh guarded stack is mapped. Mapping failure is fatal.
    pub fn create<F>(&self, priority: Priority, stack_size: usize, body: F) -> FiberId
    where
        F: FnOnce() -> FiberResult + 'static,
    {
        let fiber = match self.take_dead(stack_size) {
            Some(fiber) => {
                self.update_stats(|s| s.stacks_reused += 1);
                fiber
            }
            None => self.allocate(stack_size),
        };

        fiber.flags.set(FiberFlags::empty());
        fiber.name.set(None);
        fiber.base_priority.set(priority);
        fiber.priority.set(priority);
        fiber.result.set(None);
        fiber.body.set(Some(Box::new(body)));
        fiber.prepare();
        fiber.state.set(FiberState::Pending);
        self.runq.borrow_mut().put(priority, fiber.id());
        self.update_stats(|s| s.fibers_created += 1);
        ktrace!("created {} at priority {}", fiber.id(), priority);
        fiber.id()
    }

    fn take_dead(&self, stack_size: usize) -> Option<&Fiber> {
        let index = {
            let mut dead = self.dead.borrow_mut();
            let pos = dead
                .iter()
                .position(|&i| self.slot_fiber(i).is_some_and(|f| f.stack_fits(stack_size)))?;
            dead.remove(pos)?
        };
        let fiber = self.slot_fiber(index)?;
        fiber.id.set(fiber.id().next_generation());
        self.slots.borrow_mut()[index as usize].generation = fiber.id().generation();
        Some(fiber)
    }

    fn allocate(&self, stack_size: usize) -> &Fiber {
        let stack = match Stack::new(stack_size) {
            Ok(stack) => stack,
            Err(e) => weave_core::fatal!("cannot map a {} byte fiber stack: {}", stack_size, e),
        };
        self.update_stats(|s| s.stacks_allocated += 1);

        let free = self.free_slots.borrow_mut().pop();
        let mut slots = self.slots.borrow_mut();
        let index = match free {
            Some(index) => index,
            None => {
                slots.push(Slot { fiber: None, generation: u32::MAX });
                (slots.len() - 1) as u32
            }
        };
        let slot = &mut slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let id = FiberId::new(index, slot.generation);
        let fiber = Box::new(Fiber::new(id, Some(stack), self));
        let fiber_ptr: *const Fiber = &*fiber;
        slot.fiber = Some(fiber);
        drop(slots);
        unsafe { &*fiber_ptr }
    }

    /// Give a live fiber a name for log lines
    pub fn set_name(&self, id: FiberId, name: &'static str) -> bool {
        match self.fiber(id) {
            Some(fiber) => {
                fiber.name.set(Some(name));
                true
            }
            None => false,
        }
    }

    // ---------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------

    fn switch_to(&self, from: &Fiber, to: &Fiber) {
        to.state.set(FiberState::Running);
        self.current.set(to);
        self.update_stats(|s| s.switches += 1);
        // Safety: no RefCell borrow is held here, `from` is the running
        // fiber and `to` was either prepared or saved by an earlier switch.
        unsafe { Continuation::switch(&from.continuation, &to.continuation) };
    }

    #[inline]
    fn revert_hoist(&self, fiber: &Fiber) {
        fiber.priority.set(fiber.base_priority());
    }

    /// Pop the next runnable fiber. The master never blocks, so whenever
    /// a worker gives up control the queue holds at least the master.
    fn next_runnable(&self) -> &Fiber {
        loop {
            let next = self.runq.borrow_mut().get();
            match next {
                Some((_, id)) => {
                    if let Some(fiber) = self.fiber(id) {
                        return fiber;
                    }
                }
                None => weave_core::fatal!("strand has no runnable fiber"),
            }
        }
    }

    /// Let every runnable fiber of equal or higher priority run first
    pub fn yield_now(&self) {
        let me = self.current();
        self.revert_hoist(me);
        let next = {
            let mut runq = self.runq.borrow_mut();
            if runq.is_empty() {
                return;
            }
            runq.put(me.priority(), me.id());
            runq.get()
        };
        match next {
            Some((_, id)) if id == me.id() => {}
            Some((_, id)) => match self.fiber(id) {
                Some(next) => {
                    me.state.set(FiberState::Pending);
                    self.switch_to(me, next);
                }
                None => {
                    self.runq.borrow_mut().remove_where(me.priority(), |x| *x == me.id());
                }
            },
            None => {}
        }
    }

    /// Suspend the running fiber until someone calls [`run`](Self::run)
    /// on it. The master cannot block.
    pub fn block(&self) {
        let me = self.current();
        if me.is_master() {
            weave_core::fatal!("the master fiber cannot block");
        }
        self.revert_hoist(me);
        me.state.set(FiberState::Blocked);
        me.set_flag(FiberFlags::WAITING);
        self.blocked.borrow_mut().insert(me.id());
        let next = self.next_runnable();
        self.switch_to(me, next);
    }

    /// Make a blocked fiber runnable. Returns false (and does nothing)
    /// for runnable, dead or stale fibers.
    pub fn run(&self, id: FiberId) -> bool {
        let Some(fiber) = self.fiber(id) else {
            return false;
        };
        if fiber.state() != FiberState::Blocked {
            return false;
        }
        if fiber.flags().contains(FiberFlags::IDLE) {
            let mut idle = self.idle.borrow_mut();
            if let Some(pos) = idle.iter().position(|x| *x == id) {
                idle.remove(pos);
            }
            fiber.clear_flag(FiberFlags::IDLE);
        } else {
            self.blocked.borrow_mut().remove(&id);
        }
        fiber.clear_flag(FiberFlags::WAITING);
        fiber.state.set(FiberState::Pending);
        self.runq.borrow_mut().put(fiber.priority(), id);
        true
    }

    /// Temporarily raise a pending or blocked fiber's priority. Lower
    /// priorities are ignored; the boost ends when the fiber next gives
    /// up control.
    pub fn hoist(&self, id: FiberId, priority: Priority) -> bool {
        let Some(fiber) = self.fiber(id) else {
            return false;
        };
        let old = fiber.priority();
        if !priority.is_higher_than(old) {
            return false;
        }
        match fiber.state() {
            FiberState::Pending => {
                self.runq.borrow_mut().requeue(old, priority, |x| *x == id);
            }
            FiberState::Blocked => {}
            _ => return false,
        }
        fiber.priority.set(priority);
        true
    }

    /// Finish the running fiber: run its cleanup handlers, publish the
    /// result, wake joiners and switch away for good.
    pub fn exit(&self, result: FiberResult) -> ! {
        let me = self.current();
        if me.is_master() {
            weave_core::fatal!("the master fiber cannot exit");
        }
        me.run_cleanup();
        me.result.set(Some(result));
        me.state.set(FiberState::Invalid);
        if me.flags().contains(FiberFlags::WORKER) {
            self.workers.set(self.workers.get() - 1);
        }
        self.dead.borrow_mut().push_back(me.id().index());
        ktrace!("{} exited with {:?}", me.id(), result);

        let joiners = std::mem::take(&mut *me.joiners.borrow_mut());
        for (joiner, cell) in joiners {
            // Safety: the joiner loops until this cell is filled, so its
            // stack frame is still alive.
            unsafe { (*cell).set(Some(result)) };
            self.run(joiner);
        }

        let next = self.next_runnable();
        self.switch_to(me, next);
        weave_core::fatal!("dead fiber {} was resumed", me.id())
    }

    /// Wait for another fiber to finish and return its result.
    ///
    /// Returns `None` for unknown or stale ids, or when called from the
    /// master (which cannot block).
    pub fn join(&self, id: FiberId) -> Option<FiberResult> {
        let target = self.slot_fiber(id.index()).filter(|f| f.id() == id)?;
        if target.state() == FiberState::Invalid {
            return target.result.get();
        }
        let me = self.current();
        if me.is_master() || ptr::eq(me, target) {
            return None;
        }
        let cell: Cell<Option<FiberResult>> = Cell::new(None);
        target.joiners.borrow_mut().push((me.id(), &cell as *const _));
        while cell.get().is_none() {
            self.block();
        }
        cell.get()
    }

    // ---------------------------------------------------------------
    // Cancellation and cleanup
    // ---------------------------------------------------------------

    /// Ask a fiber to cancel; wakes it if it is blocked
    pub fn cancel(&self, id: FiberId) -> bool {
        let Some(fiber) = self.fiber(id) else {
            return false;
        };
        if fiber.is_master() {
            return false;
        }
        fiber.set_flag(FiberFlags::CANCEL_REQUESTED);
        self.run(id);
        true
    }

    /// Cancellation point for the running fiber
    pub fn testcancel(&self) -> Result<(), Canceled> {
        let me = self.current();
        if me.flags().cancel_due() {
            me.set_flag(FiberFlags::CANCEL_OCCURRED);
            return Err(Canceled);
        }
        Ok(())
    }

    /// Enable or disable cancellation; returns the previous setting
    pub fn set_cancel_enabled(&self, enabled: bool) -> bool {
        let me = self.current();
        let was = !me.flags().contains(FiberFlags::CANCEL_DISABLED);
        if enabled {
            me.clear_flag(FiberFlags::CANCEL_DISABLED);
        } else {
            me.set_flag(FiberFlags::CANCEL_DISABLED);
        }
        was
    }

    /// Push a handler onto the running fiber's cleanup stack
    pub fn push_cleanup<F>(&self, handler: F)
    where
        F: FnOnce() + 'static,
    {
        self.current().cleanup.borrow_mut().push(Box::new(handler));
    }

    /// Pop the newest cleanup handler, running it if `execute`
    pub fn pop_cleanup(&self, execute: bool) -> bool {
        let handler = self.current().cleanup.borrow_mut().pop();
        match handler {
            Some(handler) => {
                if execute {
                    handler();
                }
                true
            }
            None => false,
        }
    }

    // ---------------------------------------------------------------
    // Tasks and workers
    // ---------------------------------------------------------------

    #[inline]
    fn publish_task_count(&self, len: usize) {
        self.task_count.store(len, Ordering::Relaxed);
    }

    /// Tasks queued locally, as last published for peers
    #[inline]
    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::Relaxed)
    }

    /// Queue a task and wake the longest-idle worker
    pub fn add_task(&self, task: Task) {
        let len = {
            let mut tasks = self.tasks.borrow_mut();
            tasks.push(task);
            tasks.len()
        };
        self.publish_task_count(len);
        let first_idle = self.idle.borrow().front().copied();
        if let Some(worker) = first_idle {
            self.run(worker);
        }
    }

    pub fn pop_task(&self) -> Option<Task> {
        let (task, len) = {
            let mut tasks = self.tasks.borrow_mut();
            (tasks.pop(), tasks.len())
        };
        self.publish_task_count(len);
        task
    }

    /// Remove up to `max` tasks that agree to move to context `target`
    pub fn take_reassignable(&self, max: usize, target: u32) -> Vec<Task> {
        let (taken, len) = {
            let mut tasks = self.tasks.borrow_mut();
            (tasks.take_reassignable(max, target), tasks.len())
        };
        self.publish_task_count(len);
        taken
    }

    /// Tasks queued locally (owner view)
    pub fn tasks_len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Fibers waiting in the run queue
    pub fn runnable(&self) -> usize {
        self.runq.borrow().len()
    }

    pub fn workers(&self) -> usize {
        self.workers.get()
    }

    pub fn idle_workers(&self) -> usize {
        self.idle.borrow().len()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.get()
    }

    /// Start `workers_min` workers
    pub fn start_workers(&self) {
        while self.workers.get() < self.workers_min {
            if self.spawn_worker().is_none() {
                break;
            }
        }
    }

    /// Add one worker fiber; refused at `workers_max` (warned once)
    pub fn spawn_worker(&self) -> Option<FiberId> {
        if self.workers.get() >= self.workers_max {
            if !self.limit_warned.replace(true) {
                kwarn!("worker pool at its limit of {}; not spawning", self.workers_max);
            }
            return None;
        }
        let strand: *const Strand = self;
        let interval = self.worker_yield_interval;
        let id = self.spawn(Priority::WORKER, move || {
            // Safety: the strand outlives its fibers.
            worker_main(unsafe { &*strand }, interval)
        });
        if let Some(fiber) = self.fiber(id) {
            fiber.set_flag(FiberFlags::WORKER);
            fiber.name.set(Some("worker"));
        }
        self.workers.set(self.workers.get() + 1);
        self.update_stats(|s| s.workers_spawned += 1);
        kdebug!("spawned worker {} ({} total)", id, self.workers.get());
        Some(id)
    }

    /// Park the running worker at the back of the idle queue
    fn park_idle(&self) {
        let me = self.current();
        self.revert_hoist(me);
        me.state.set(FiberState::Blocked);
        me.set_flag(FiberFlags::IDLE);
        self.idle.borrow_mut().push_back(me.id());
        let next = self.next_runnable();
        self.switch_to(me, next);
    }

    pub(crate) fn note_task_run(&self) {
        self.update_stats(|s| s.tasks_run += 1);
    }

    // ---------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------

    /// Release dead fibers (and their stacks) above the reuse limit
    pub fn trim(&self) -> usize {
        let mut released = 0;
        loop {
            let index = {
                let mut dead = self.dead.borrow_mut();
                if dead.len() <= self.dead_fiber_limit {
                    break;
                }
                dead.pop_front()
            };
            let Some(index) = index else { break };
            let fiber = self.slots.borrow_mut()[index as usize].fiber.take();
            drop(fiber);
            self.free_slots.borrow_mut().push(index);
            released += 1;
        }
        if released > 0 {
            self.update_stats(|s| s.stacks_released += released as u64);
        }
        released
    }

    pub fn census(&self) -> Census {
        let slots = self.slots.borrow();
        let live = slots
            .iter()
            .filter_map(|s| s.fiber.as_ref())
            .filter(|f| f.state() != FiberState::Invalid)
            .count();
        Census {
            live,
            runnable: self.runq.borrow().len(),
            idle: self.idle.borrow().len(),
            blocked: self.blocked.borrow().len(),
            dead: self.dead.borrow().len(),
            workers: self.workers.get(),
        }
    }

    /// Cancel every fiber, give them a bounded number of rounds to
    /// finish, then release everything. Master only.
    pub fn shutdown(&self) {
        if !self.in_master() {
            weave_core::fatal!("strand shutdown from a non-master fiber");
        }
        self.stopping.set(true);

        let ids: Vec<FiberId> = {
            let slots = self.slots.borrow();
            slots
                .iter()
                .filter_map(|s| s.fiber.as_ref())
                .filter(|f| !f.is_master() && f.state() != FiberState::Invalid)
                .map(|f| f.id())
                .collect()
        };
        for id in ids {
            self.cancel(id);
        }

        for _ in 0..SHUTDOWN_ROUNDS {
            if self.census().live <= 1 {
                break;
            }
            self.yield_now();
        }
        let left = self.census().live - 1;
        if left > 0 {
            kwarn!("{} fibers ignored shutdown; releasing them anyway", left);
        }
        self.destroy();
    }

    /// Drop every fiber but the master and discard queued tasks
    fn destroy(&self) {
        self.tasks.borrow_mut().clear();
        self.publish_task_count(0);
        self.runq.borrow_mut().drain().for_each(drop);
        self.idle.borrow_mut().clear();
        self.blocked.borrow_mut().clear();
        self.dead.borrow_mut().clear();
        let fibers: Vec<Box<Fiber>> = {
            let mut slots = self.slots.borrow_mut();
            slots.iter_mut().skip(1).filter_map(|s| s.fiber.take()).collect()
        };
        let released = fibers.len() as u64;
        drop(fibers);
        self.update_stats(|s| s.stacks_released += released);
        self.workers.set(0);
    }
}

impl Drop for Strand {
    fn drop(&mut self) {
        if !self.in_master() {
            kwarn!("strand dropped while {} was running", self.current_id());
        }
        self.destroy();
    }
}

fn worker_main(strand: &Strand, yield_interval: u32) -> FiberResult {
    let mut since_yield = 0;
    loop {
        strand.testcancel()?;
        match strand.pop_task() {
            Some(task) => {
                task.run();
                strand.note_task_run();
                since_yield += 1;
                if since_yield >= yield_interval {
                    since_yield = 0;
                    strand.yield_now();
                }
            }
            None => {
                since_yield = 0;
                strand.park_idle();
            }
        }
    }
}
