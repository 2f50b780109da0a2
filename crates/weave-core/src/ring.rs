//! Lock-free multi-producer/multi-consumer ring
//!
//! Fixed-capacity slot ring carrying fixed-size payloads between OS
//! threads. Each slot carries a sequence counter; whether a producer or
//! a consumer owns a slot is decided solely by comparing that counter to
//! the shared head/tail position, so no lock is ever held:
//!
//! ```text
//!   slot.seq == pos          -> free, producer at `pos` may claim it
//!   slot.seq == pos + 1      -> full, consumer at `pos` may take it
//!   slot.seq == pos + cap    -> consumed, free for the next lap
//! ```
//!
//! Positions are machine words that advance by one per operation and wrap
//! around (all comparisons use wrapping arithmetic). The position a
//! successful enqueue claimed is returned as its *stamp*; the consumer's
//! head position is its *dequeue stamp*. Contexts publish the dequeue
//! stamp before sleeping so producers can tell whether their message is
//! the one the sleeper has not seen.
//!
//! Ordering contract:
//! - claiming a position is a `Relaxed` CAS (positions carry no data)
//! - the slot payload is published by a `Release` store of its sequence
//!   and observed through an `Acquire` load of the same sequence.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::pad::CachePadded;

struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC ring
pub struct Ring<T> {
    /// Consumer position
    head: CachePadded<AtomicUsize>,
    /// Producer position
    tail: CachePadded<AtomicUsize>,
    slots: Box<[Slot<T>]>,
    mask: usize,
}

// Safety: values move between threads through slots whose ownership is
// handed over with release/acquire on the slot sequence.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

#[inline]
fn diff(a: usize, b: usize) -> isize {
    a.wrapping_sub(b) as isize
}

impl<T> Ring<T> {
    /// Create a ring holding at least `capacity` items (rounded up to a
    /// power of two, minimum 2).
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_initial_position(capacity, 0)
    }

    /// Create a ring whose positions start at `start` instead of zero.
    ///
    /// Used to exercise position wraparound without pushing 2^64 items.
    #[doc(hidden)]
    pub fn with_initial_position(capacity: usize, start: usize) -> Self {
        let capacity = capacity.max(2).checked_next_power_of_two().unwrap_or_else(|| {
            crate::fatal!("ring capacity {} overflows", capacity)
        });
        let mask = capacity - 1;
        let slots: Vec<Slot<T>> = (0..capacity)
            .map(|_| Slot {
                seq: AtomicUsize::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        for i in 0..capacity {
            let pos = start.wrapping_add(i);
            slots[pos & mask].seq.store(pos, Ordering::Relaxed);
        }
        Ring {
            head: CachePadded::new(AtomicUsize::new(start)),
            tail: CachePadded::new(AtomicUsize::new(start)),
            slots: slots.into_boxed_slice(),
            mask,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Enqueue without blocking.
    ///
    /// Returns the claimed position (the enqueue stamp), or gives the
    /// value back if the ring is full.
    pub fn try_enqueue(&self, value: T) -> Result<usize, T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let d = diff(seq, pos);
            if d == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: the CAS made us the only writer of this slot
                        // until we publish the new sequence.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(pos);
                    }
                    Err(current) => pos = current,
                }
            } else if d < 0 {
                // Slot still holds last lap's value: full.
                return Err(value);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue without blocking; `None` when no published item is at head.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let d = diff(seq, pos.wrapping_add(1));
            if d == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: the sequence said the slot is full and the CAS
                        // made us its only reader.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if d < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Current consumer position: the stamp a sleeping consumer publishes.
    #[inline]
    pub fn dequeue_stamp(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    /// Current producer position
    #[inline]
    pub fn enqueue_stamp(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    /// True if the item at the consumer position has been published.
    ///
    /// A claimed-but-unpublished slot reads as not ready; its producer
    /// is then the one responsible for notifying.
    #[inline]
    pub fn has_ready(&self) -> bool {
        let pos = self.head.load(Ordering::Acquire);
        let seq = self.slots[pos & self.mask].seq.load(Ordering::Acquire);
        seq == pos.wrapping_add(1)
    }

    /// Approximate number of queued items
    #[inline]
    pub fn len_hint(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.capacity())
    }

    #[inline]
    pub fn is_empty_hint(&self) -> bool {
        self.len_hint() == 0
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        while self.try_dequeue().is_some() {}
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(Ring::<u32>::with_capacity(0).capacity(), 2);
        assert_eq!(Ring::<u32>::with_capacity(5).capacity(), 8);
        assert_eq!(Ring::<u32>::with_capacity(64).capacity(), 64);
    }

    #[test]
    fn test_fifo_and_full() {
        let ring = Ring::with_capacity(4);
        for i in 0..4u32 {
            assert_eq!(ring.try_enqueue(i), Ok(i as usize));
        }
        assert_eq!(ring.try_enqueue(99), Err(99));
        assert!(ring.has_ready());
        for i in 0..4u32 {
            assert_eq!(ring.try_dequeue(), Some(i));
        }
        assert_eq!(ring.try_dequeue(), None);
        assert!(!ring.has_ready());
        assert_eq!(ring.dequeue_stamp(), 4);
    }

    #[test]
    fn test_positions_wrap() {
        let start = usize::MAX - 2;
        let ring = Ring::with_initial_position(4, start);
        let mut stamps = Vec::new();
        for i in 0..10u64 {
            stamps.push(ring.try_enqueue(i).unwrap());
            assert_eq!(ring.try_dequeue(), Some(i));
        }
        assert_eq!(stamps[0], start);
        assert_eq!(stamps[3], 0);
        assert_eq!(ring.dequeue_stamp(), start.wrapping_add(10));
        // Full detection still works across the wrap.
        for i in 0..4u64 {
            ring.try_enqueue(i).unwrap();
        }
        assert!(ring.try_enqueue(4).is_err());
        assert_eq!(ring.len_hint(), 4);
    }

    #[test]
    fn test_spsc_order() {
        let ring = Arc::new(Ring::with_capacity(64));
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..100_000u64 {
                    let mut v = i;
                    while let Err(back) = ring.try_enqueue(v) {
                        v = back;
                        thread::yield_now();
                    }
                }
            })
        };
        let mut expected = 0u64;
        while expected < 100_000 {
            match ring.try_dequeue() {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                None => std::hint::spin_loop(),
            }
        }
        producer.join().unwrap();
        assert!(ring.try_dequeue().is_none());
    }

    #[test]
    fn test_mpsc_exactly_once() {
        const PRODUCERS: u64 = 6;
        const PER: u64 = 20_000;
        let ring = Arc::new(Ring::with_capacity(128));
        let done = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..PER {
                        let mut tag = (p << 32) | i;
                        while let Err(back) = ring.try_enqueue(tag) {
                            tag = back;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumer = {
            let ring = Arc::clone(&ring);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut seen: HashMap<u64, u32> = HashMap::new();
                let mut last = vec![None::<u64>; PRODUCERS as usize];
                loop {
                    match ring.try_dequeue() {
                        Some(tag) => {
                            *seen.entry(tag).or_default() += 1;
                            // Per-producer send order is preserved.
                            let p = (tag >> 32) as usize;
                            let i = tag & 0xffff_ffff;
                            if let Some(prev) = last[p] {
                                assert!(i > prev, "producer {} reordered", p);
                            }
                            last[p] = Some(i);
                        }
                        None if done.load(Ordering::Acquire) => break,
                        None => std::hint::spin_loop(),
                    }
                }
                seen
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        done.store(true, Ordering::Release);
        let mut seen = consumer.join().unwrap();
        // Anything left after the consumer's final check
        while let Some(tag) = ring.try_dequeue() {
            *seen.entry(tag).or_default() += 1;
        }

        assert_eq!(seen.len() as u64, PRODUCERS * PER);
        for p in 0..PRODUCERS {
            for i in 0..PER {
                assert_eq!(seen.get(&((p << 32) | i)), Some(&1));
            }
        }
    }

    #[test]
    fn test_mpmc_sum() {
        let ring = Arc::new(Ring::with_capacity(32));
        let total = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(AtomicUsize::new(0));
        const N: usize = 4 * 10_000;

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..10_000usize {
                        let mut v = p * 10_000 + i + 1;
                        while let Err(back) = ring.try_enqueue(v) {
                            v = back;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let total = Arc::clone(&total);
                let received = Arc::clone(&received);
                thread::spawn(move || {
                    while received.load(Ordering::Relaxed) < N {
                        if let Some(v) = ring.try_dequeue() {
                            total.fetch_add(v, Ordering::Relaxed);
                            received.fetch_add(1, Ordering::Relaxed);
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for h in producers.into_iter().chain(consumers) {
            h.join().unwrap();
        }
        assert_eq!(total.load(Ordering::Relaxed), N * (N + 1) / 2);
    }

    #[test]
    fn test_drop_releases_items() {
        let marker = Arc::new(());
        {
            let ring = Ring::with_capacity(4);
            ring.try_enqueue(Arc::clone(&marker)).unwrap();
            ring.try_enqueue(Arc::clone(&marker)).unwrap();
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
