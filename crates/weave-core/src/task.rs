//! Lightweight tasks and the per-context task list
//!
//! A task is a `(routine, arg)` pair: a pointer to a static vtable and
//! one machine word. Tasks are far cheaper than fibers: worker fibers
//! pull them off their context's list and run them to completion.
//!
//! The list is an unbounded chain of fixed-size ring segments, appended
//! at the tail and consumed at the head in FIFO order. It is owned by
//! one context and never touched by another thread; cross-thread moves
//! go through async calls that carry the two words of a task.

use std::collections::VecDeque;
use std::fmt;

use crate::constants::TASK_SEGMENT;

/// Task vtable
pub struct TaskRoutine {
    /// Run the task; the return value is handed to `complete`
    pub execute: fn(arg: usize) -> usize,
    /// Called after `execute` on the same thread
    pub complete: fn(arg: usize, result: usize),
    /// Asked before moving the task to context `target`; `false` pins it
    pub reassign: fn(arg: usize, target: u32) -> bool,
    /// Releases `arg` when a queued task is dropped unexecuted
    pub discard: fn(arg: usize),
}

impl TaskRoutine {
    pub fn complete_noop(_arg: usize, _result: usize) {}
    pub fn reassign_always(_arg: usize, _target: u32) -> bool {
        true
    }
    pub fn reassign_never(_arg: usize, _target: u32) -> bool {
        false
    }
    pub fn discard_noop(_arg: usize) {}
}

/// One queued task
#[derive(Clone, Copy)]
pub struct Task {
    routine: &'static TaskRoutine,
    arg: usize,
}

// Safety: routines are plain fn pointers; `arg` ownership travels with
// the task and every routine's contract is to be callable on any
// context thread it is reassigned to.
unsafe impl Send for Task {}

impl Task {
    #[inline]
    pub const fn new(routine: &'static TaskRoutine, arg: usize) -> Self {
        Task { routine, arg }
    }

    /// Wrap a closure. The closure may move to any context.
    pub fn boxed<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let boxed: Box<Box<dyn FnOnce() + Send>> = Box::new(Box::new(f));
        Task::new(&BOXED_TASK, Box::into_raw(boxed) as usize)
    }

    /// True for tasks made by [`Task::boxed`], which run at most once
    #[inline]
    pub fn is_boxed(&self) -> bool {
        core::ptr::eq(self.routine, &BOXED_TASK)
    }

    #[inline]
    pub fn routine(&self) -> &'static TaskRoutine {
        self.routine
    }

    #[inline]
    pub fn arg(&self) -> usize {
        self.arg
    }

    /// Execute and complete
    #[inline]
    pub fn run(self) {
        let result = (self.routine.execute)(self.arg);
        (self.routine.complete)(self.arg, result);
    }

    #[inline]
    pub fn may_reassign(&self, target: u32) -> bool {
        (self.routine.reassign)(self.arg, target)
    }

    /// Drop without running
    #[inline]
    pub fn discard(self) {
        (self.routine.discard)(self.arg)
    }

    /// Two words for an async call: `(routine, arg)`
    #[inline]
    pub fn to_words(self) -> [usize; 2] {
        [self.routine as *const TaskRoutine as usize, self.arg]
    }

    /// Rebuild a task from `to_words`.
    ///
    /// # Safety
    ///
    /// `words` must come from `Task::to_words` of a task not yet run,
    /// discarded or rebuilt elsewhere.
    #[inline]
    pub unsafe fn from_words(words: [usize; 2]) -> Self {
        Task { routine: &*(words[0] as *const TaskRoutine), arg: words[1] }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({:p}, {:#x})", self.routine, self.arg)
    }
}

static BOXED_TASK: TaskRoutine = TaskRoutine {
    execute: boxed_execute,
    complete: TaskRoutine::complete_noop,
    reassign: TaskRoutine::reassign_always,
    discard: boxed_discard,
};

fn boxed_execute(arg: usize) -> usize {
    // Safety: `arg` came from `Task::boxed` and is consumed exactly once.
    let f = unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce() + Send>) };
    f();
    0
}

fn boxed_discard(arg: usize) {
    // Safety: as above; dropping instead of calling.
    drop(unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce() + Send>) });
}

struct Segment {
    slots: [Option<Task>; TASK_SEGMENT],
    head: usize,
    tail: usize,
}

impl Segment {
    fn new() -> Box<Self> {
        Box::new(Segment { slots: [None; TASK_SEGMENT], head: 0, tail: 0 })
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.tail == TASK_SEGMENT
    }

    #[inline]
    fn is_drained(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    fn put(&mut self, task: Task) {
        self.slots[self.tail] = Some(task);
        self.tail += 1;
    }

    fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

/// Segmented FIFO of tasks owned by one context
pub struct TaskList {
    segments: VecDeque<Box<Segment>>,
    spare: Option<Box<Segment>>,
    /// Lifetime enqueue count
    head_count: u64,
    /// Lifetime dequeue count
    tail_count: u64,
}

impl TaskList {
    pub fn new() -> Self {
        TaskList { segments: VecDeque::new(), spare: None, head_count: 0, tail_count: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        (self.head_count - self.tail_count) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head_count == self.tail_count
    }

    pub fn enqueued_total(&self) -> u64 {
        self.head_count
    }

    pub fn dequeued_total(&self) -> u64 {
        self.tail_count
    }

    pub fn push(&mut self, task: Task) {
        match self.segments.back_mut() {
            Some(seg) if !seg.is_full() => seg.put(task),
            _ => {
                let mut seg = self.spare.take().unwrap_or_else(Segment::new);
                seg.put(task);
                self.segments.push_back(seg);
            }
        }
        self.head_count += 1;
    }

    pub fn pop(&mut self) -> Option<Task> {
        let seg = self.segments.front_mut()?;
        let task = seg.slots[seg.head].take()?;
        seg.head += 1;
        let drained = seg.is_drained();
        let full = seg.is_full();
        self.tail_count += 1;
        if drained && (full || self.segments.len() > 1) {
            self.retire_front();
        } else if drained {
            if let Some(seg) = self.segments.front_mut() {
                seg.reset();
            }
        }
        Some(task)
    }

    fn retire_front(&mut self) {
        if let Some(mut seg) = self.segments.pop_front() {
            seg.reset();
            if self.spare.is_none() {
                self.spare = Some(seg);
            }
        }
    }

    /// Pop up to `max` tasks that agree to move to `target`.
    ///
    /// Tasks that refuse keep their relative order at the head of the
    /// list.
    pub fn take_reassignable(&mut self, max: usize, target: u32) -> Vec<Task> {
        let mut moved = Vec::with_capacity(max);
        let mut pinned = Vec::new();
        // Bound the scan so a list full of pinned tasks costs O(max) pops.
        let scan = self.len().min(max.saturating_mul(4).max(max));
        for _ in 0..scan {
            if moved.len() == max {
                break;
            }
            match self.pop() {
                Some(task) if task.may_reassign(target) => moved.push(task),
                Some(task) => pinned.push(task),
                None => break,
            }
        }
        for task in pinned.into_iter().rev() {
            self.push_front(task);
        }
        moved
    }

    /// Put a task back at the head
    fn push_front(&mut self, task: Task) {
        match self.segments.front_mut() {
            Some(seg) if seg.head > 0 => {
                seg.head -= 1;
                seg.slots[seg.head] = Some(task);
            }
            _ => {
                let mut seg = self.spare.take().unwrap_or_else(Segment::new);
                seg.head = TASK_SEGMENT - 1;
                seg.tail = TASK_SEGMENT;
                seg.slots[seg.head] = Some(task);
                self.segments.push_front(seg);
            }
        }
        self.tail_count -= 1;
    }

    /// Discard every queued task
    pub fn clear(&mut self) {
        while let Some(task) = self.pop() {
            task.discard();
        }
    }
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskList {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskList")
            .field("len", &self.len())
            .field("segments", &self.segments.len())
            .finish()
    }
}
