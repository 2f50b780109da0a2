//! Epoch-based deferred reclamation
//!
//! Every listener owns one [`EpochSlot`]. While it is inside a poll (and
//! may hold raw pointers obtained from the backend) its slot carries the
//! global epoch it observed on entry; outside it carries
//! [`QUIESCENT`]. The global epoch only advances when every slot is
//! either quiescent or already at the current global value, so an item
//! retired at epoch `e` is unreachable from any poll once the global
//! epoch reaches `e + 2`.
//!
//! ```text
//!   global:        e        e+1        e+2
//!   listener A:  [--poll@e--]
//!   listener B:       [----poll@e----]     <- blocks e+1 -> e+2
//!   retire X@e                            free X (global >= e+2)
//! ```

use core::sync::atomic::{fence, AtomicU64, Ordering};
use std::collections::VecDeque;
use std::fmt;

use crate::pad::CachePadded;

/// Slot value of a listener outside any critical section
pub const QUIESCENT: u64 = 0;

/// One listener's published epoch
#[derive(Default)]
pub struct EpochSlot {
    local: AtomicU64,
}

impl EpochSlot {
    pub const fn new() -> Self {
        EpochSlot { local: AtomicU64::new(QUIESCENT) }
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.local.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.load() != QUIESCENT
    }
}

impl fmt::Debug for EpochSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.load() {
            QUIESCENT => write!(f, "EpochSlot(quiescent)"),
            e => write!(f, "EpochSlot({})", e),
        }
    }
}

/// The global epoch plus every listener's slot
pub struct EpochCollector {
    global: CachePadded<AtomicU64>,
    slots: Box<[CachePadded<EpochSlot>]>,
}

impl EpochCollector {
    pub fn new(listeners: usize) -> Self {
        EpochCollector {
            // 0 is reserved for "quiescent"
            global: CachePadded::new(AtomicU64::new(1)),
            slots: (0..listeners).map(|_| CachePadded::new(EpochSlot::new())).collect(),
        }
    }

    #[inline]
    pub fn global(&self) -> u64 {
        self.global.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn listeners(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot(&self, listener: usize) -> &EpochSlot {
        &self.slots[listener]
    }

    /// Enter the critical section; returns the epoch pinned
    pub fn enter(&self, listener: usize) -> u64 {
        let slot = &self.slots[listener];
        let mut epoch = self.global();
        loop {
            slot.local.store(epoch, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            // If the global moved while we published, pin the newer value so
            // we never hold back an advance we did not observe.
            let now = self.global();
            if now == epoch {
                return epoch;
            }
            epoch = now;
        }
    }

    /// Leave the critical section
    #[inline]
    pub fn leave(&self, listener: usize) {
        self.slots[listener].local.store(QUIESCENT, Ordering::Release);
    }

    /// Advance the global epoch if every listener is quiescent or current.
    ///
    /// Returns the global epoch after the attempt.
    pub fn try_advance(&self) -> u64 {
        let epoch = self.global();
        fence(Ordering::SeqCst);
        let blocked = self.slots.iter().any(|slot| {
            let local = slot.load();
            local != QUIESCENT && local != epoch
        });
        if blocked {
            return epoch;
        }
        match self.global.compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => epoch + 1,
            Err(current) => current,
        }
    }

    /// True once items retired at `retired_at` can no longer be observed
    #[inline]
    pub fn is_safe(&self, retired_at: u64) -> bool {
        self.global() >= retired_at + 2
    }
}

impl fmt::Debug for EpochCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochCollector")
            .field("global", &self.global())
            .field("slots", &self.slots.iter().map(|s| s.load()).collect::<Vec<_>>())
            .finish()
    }
}

/// Per-listener list of items waiting for the epoch to pass
pub struct RetireList<T> {
    items: VecDeque<(u64, T)>,
}

impl<T> RetireList<T> {
    pub fn new() -> Self {
        RetireList { items: VecDeque::new() }
    }

    /// Tag `item` with the current global epoch
    pub fn retire(&mut self, collector: &EpochCollector, item: T) {
        self.items.push_back((collector.global(), item));
    }

    /// Hand every item whose grace period has passed to `free`.
    ///
    /// Items are tagged in non-decreasing epoch order, so the scan stops
    /// at the first one still unsafe.
    pub fn reclaim<F>(&mut self, collector: &EpochCollector, mut free: F) -> usize
    where
        F: FnMut(T),
    {
        let mut freed = 0;
        while let Some(&(epoch, _)) = self.items.front() {
            if !collector.is_safe(epoch) {
                break;
            }
            if let Some((_, item)) = self.items.pop_front() {
                free(item);
                freed += 1;
            }
        }
        freed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Take everything regardless of epoch (final teardown only)
    pub fn drain_all(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..).map(|(_, item)| item)
    }
}

impl<T> Default for RetireList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_advance_needs_all_current() {
        let c = EpochCollector::new(2);
        assert_eq!(c.global(), 1);
        assert_eq!(c.try_advance(), 2);

        let pinned = c.enter(0);
        assert_eq!(pinned, 2);
        // Listener 0 is current, so one more step is allowed...
        assert_eq!(c.try_advance(), 3);
        // ...but no further while it stays inside.
        assert_eq!(c.try_advance(), 3);
        c.leave(0);
        assert_eq!(c.try_advance(), 4);
    }

    #[test]
    fn test_nothing_freed_while_mid_poll() {
        let c = EpochCollector::new(2);
        let mut retired = RetireList::new();
        let freed = AtomicUsize::new(0);

        c.enter(0);
        retired.retire(&c, 42u32);
        for _ in 0..100 {
            c.try_advance();
            retired.reclaim(&c, |_| {
                freed.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(freed.load(Ordering::Relaxed), 0);
        assert_eq!(retired.len(), 1);

        c.leave(0);
        c.try_advance();
        c.try_advance();
        retired.reclaim(&c, |v| {
            assert_eq!(v, 42);
            freed.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(freed.load(Ordering::Relaxed), 1);
        assert!(retired.is_empty());
    }

    /// A poller keeps dereferencing items it found published while other
    /// threads retire and reclaim them. A premature free would flip the
    /// `alive` flag the poller asserts on.
    #[test]
    fn test_concurrent_poll_and_reclaim() {
        struct Item {
            alive: AtomicBool,
        }

        const ROUNDS: usize = 2_000;
        let c = Arc::new(EpochCollector::new(2));
        let published = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let poller = {
            let c = Arc::clone(&c);
            let published = Arc::clone(&published);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut seen = 0usize;
                while !stop.load(Ordering::Acquire) {
                    c.enter(1);
                    let ptr = published.load(Ordering::Acquire) as *const Item;
                    if !ptr.is_null() {
                        for _ in 0..8 {
                            // Safety: the item was published before we pinned
                            // and cannot be freed until we leave.
                            assert!(unsafe { (*ptr).alive.load(Ordering::Acquire) });
                            std::hint::spin_loop();
                        }
                        seen += 1;
                    }
                    c.leave(1);
                }
                seen
            })
        };

        let mut retired: RetireList<Box<Item>> = RetireList::new();
        let mut total_freed = 0;
        for _ in 0..ROUNDS {
            let item = Box::new(Item { alive: AtomicBool::new(true) });
            let old = published.swap(&*item as *const Item as u64, Ordering::AcqRel);
            std::mem::forget(item);
            if old != 0 {
                // Safety: `old` was leaked above and is unpublished now.
                retired.retire(&c, unsafe { Box::from_raw(old as *mut Item) });
            }
            c.enter(0);
            c.leave(0);
            c.try_advance();
            total_freed += retired.reclaim(&c, |item| {
                item.alive.store(false, Ordering::Release);
                // Keep the allocation so a racing reader trips the flag
                // instead of touching freed memory.
                std::mem::forget(item);
            });
        }

        stop.store(true, Ordering::Release);
        let seen = poller.join().unwrap();
        assert!(seen > 0 || total_freed > 0);
        let last = published.swap(0, Ordering::AcqRel);
        if last != 0 {
            drop(unsafe { Box::from_raw(last as *mut Item) });
        }
        drop(retired.drain_all().collect::<Vec<_>>());
    }
}
