//! Approximate timer queue
//!
//! A window of `n` near buckets, each `resolution` wide, plus one
//! overflow bucket for everything past the window. Entries inside a
//! bucket are unordered: a timer fires on the first `expire` whose clock
//! is at or past its deadline, but timers within one bucket may fire in
//! any order relative to each other.
//!
//! When the cursor walks off the end of the window the queue is
//! rebalanced: the window is re-based at the current clock (or at the
//! earliest overflow deadline when the window is empty) and overflow
//! entries that now fall inside it are moved into their buckets.
//!
//! # Cancellation
//!
//! Lazy, like a heap-backed timer: cancelled handles go into a set and
//! are skipped when their bucket is drained. The set is cleared whenever
//! the queue empties.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

/// Identifies one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

struct Entry<A> {
    handle: TimerHandle,
    /// Microseconds since the queue's origin
    deadline: u64,
    /// 0 for one-shot
    interval: u64,
    action: A,
}

/// Bucketed timer queue owned by one listener
pub struct TimerQueue<A> {
    origin: Instant,
    resolution: u64,
    near: Vec<Vec<Entry<A>>>,
    overflow: Vec<Entry<A>>,
    /// Tick at which bucket 0 starts
    base: u64,
    cursor: usize,
    near_len: usize,
    overflow_min: u64,
    cancelled: HashSet<TimerHandle>,
    next_handle: u64,
    rebalances: u64,
}

impl<A: Clone> TimerQueue<A> {
    /// `buckets` near buckets of `resolution` each (both at least 1)
    pub fn new(buckets: usize, resolution: Duration) -> Self {
        Self::with_origin(buckets, resolution, Instant::now())
    }

    pub fn with_origin(buckets: usize, resolution: Duration, origin: Instant) -> Self {
        let buckets = buckets.max(1);
        TimerQueue {
            origin,
            resolution: (resolution.as_micros() as u64).max(1),
            near: (0..buckets).map(|_| Vec::new()).collect(),
            overflow: Vec::new(),
            base: 0,
            cursor: 0,
            near_len: 0,
            overflow_min: u64::MAX,
            cancelled: HashSet::new(),
            next_handle: 1,
            rebalances: 0,
        }
    }

    #[inline]
    fn tick(&self, t: Instant) -> u64 {
        t.saturating_duration_since(self.origin).as_micros() as u64
    }

    #[inline]
    fn window_end(&self) -> u64 {
        self.base + self.resolution * self.near.len() as u64
    }

    /// Arm a timer. A zero `interval` makes it one-shot.
    pub fn arm(&mut self, deadline: Instant, interval: Duration, action: A) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let entry = Entry {
            handle,
            deadline: self.tick(deadline),
            interval: interval.as_micros() as u64,
            action,
        };
        self.insert(entry);
        handle
    }

    /// Arm a one-shot timer `after` from now
    pub fn arm_after(&mut self, after: Duration, action: A) -> TimerHandle {
        self.arm(Instant::now() + after, Duration::ZERO, action)
    }

    fn insert(&mut self, entry: Entry<A>) {
        if entry.deadline >= self.window_end() {
            self.overflow_min = self.overflow_min.min(entry.deadline);
            self.overflow.push(entry);
            return;
        }
        // Past deadlines land in the cursor bucket and fire on the next
        // expire.
        let slot = (entry.deadline.saturating_sub(self.base) / self.resolution) as usize;
        let slot = slot.max(self.cursor);
        self.near[slot].push(entry);
        self.near_len += 1;
    }

    /// Lazily cancel. Returns false if the handle was already cancelled.
    pub fn disarm(&mut self, handle: TimerHandle) -> bool {
        if handle.0 == 0 || handle.0 >= self.next_handle || self.is_empty() {
            return false;
        }
        self.cancelled.insert(handle)
    }

    /// Fire every timer whose deadline is at or before `now`.
    ///
    /// Periodic timers are re-armed from their previous deadline, skipping
    /// whole intervals already in the past. Returns the number fired.
    pub fn expire<F>(&mut self, now: Instant, mut fire: F) -> usize
    where
        F: FnMut(TimerHandle, &A),
    {
        let now = self.tick(now);
        let mut fired = 0;
        let mut rearm = Vec::new();

        loop {
            if self.cursor == self.near.len() {
                self.rebalance(now);
            }
            let start = self.base + self.cursor as u64 * self.resolution;
            if start > now {
                // Window lies in the future; only early placements can be due.
                fired += self.fire_bucket(self.cursor, now, &mut fire, &mut rearm);
                break;
            }
            fired += self.fire_bucket(self.cursor, now, &mut fire, &mut rearm);
            if start + self.resolution <= now {
                self.cursor += 1;
                continue;
            }
            break;
        }

        for entry in rearm {
            self.insert(entry);
        }
        if self.is_empty() {
            self.cancelled.clear();
        }
        fired
    }

    fn fire_bucket<F>(
        &mut self,
        slot: usize,
        now: u64,
        fire: &mut F,
        rearm: &mut Vec<Entry<A>>,
    ) -> usize
    where
        F: FnMut(TimerHandle, &A),
    {
        let bucket = std::mem::take(&mut self.near[slot]);
        let mut keep = Vec::new();
        let mut fired = 0;
        for mut entry in bucket {
            if self.cancelled.remove(&entry.handle) {
                self.near_len -= 1;
                continue;
            }
            if entry.deadline > now {
                keep.push(entry);
                continue;
            }
            self.near_len -= 1;
            fire(entry.handle, &entry.action);
            fired += 1;
            if entry.interval > 0 {
                let behind = (now - entry.deadline) / entry.interval + 1;
                entry.deadline += behind * entry.interval;
                rearm.push(entry);
            }
        }
        self.near[slot] = keep;
        fired
    }

    fn rebalance(&mut self, now: u64) {
        self.rebalances += 1;
        let anchor = if self.near_len == 0 && !self.overflow.is_empty() {
            now.max(self.overflow_min)
        } else {
            now
        };
        // Near buckets are normally empty here; leftovers are re-inserted
        // with the overflow.
        let mut pending: Vec<Entry<A>> = self.near.iter_mut().flat_map(std::mem::take).collect();
        pending.append(&mut self.overflow);
        self.near_len = 0;
        self.overflow_min = u64::MAX;
        self.base = anchor - anchor % self.resolution;
        self.cursor = 0;
        for entry in pending {
            if self.cancelled.remove(&entry.handle) {
                continue;
            }
            self.insert(entry);
        }
    }

    /// Earliest deadline worth waking for, approximate to one bucket
    pub fn next_deadline(&self) -> Option<Instant> {
        let tick = if self.near_len > 0 {
            self.near[self.cursor..]
                .iter()
                .find(|b| !b.is_empty())
                .and_then(|b| b.iter().map(|e| e.deadline).min())?
        } else if !self.overflow.is_empty() {
            self.overflow_min
        } else {
            return None;
        };
        Some(self.origin + Duration::from_micros(tick))
    }

    /// Armed entries, including lazily cancelled ones not yet swept
    #[inline]
    pub fn len(&self) -> usize {
        self.near_len + self.overflow.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    pub fn rebalances(&self) -> u64 {
        self.rebalances
    }

    /// Drop every entry, returning their actions
    pub fn drain(&mut self) -> Vec<A> {
        let near = self.near.iter_mut().flat_map(std::mem::take);
        let all: Vec<A> = near.chain(self.overflow.drain(..)).map(|e| e.action).collect();
        self.near_len = 0;
        self.overflow_min = u64::MAX;
        self.cancelled.clear();
        all
    }
}

impl<A> fmt::Debug for TimerQueue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("near", &self.near_len)
            .field("overflow", &self.overflow.len())
            .field("cursor", &self.cursor)
            .field("cancelled", &self.cancelled.len())
            .finish()
    }
}
