//! Loom models of the call ring's slot protocol and the status-word
//! wakeup handshake.
//!
//! Run with: RUSTFLAGS="--cfg loom" cargo test -p weave-core --test loom_ring --release
//!
//! Under a normal build this file compiles to nothing. The models are
//! small re-statements of `Ring` and `StatusWord` over loom atomics: two
//! slots and two or three threads are enough to exercise every
//! ownership transition.

#![cfg(loom)]

use loom::cell::UnsafeCell;
use loom::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

// ============================================================================
// Slot-sequence ring
// ============================================================================

struct Slot {
    seq: AtomicUsize,
    value: UnsafeCell<usize>,
}

struct LoomRing {
    head: AtomicUsize,
    tail: AtomicUsize,
    slots: Vec<Slot>,
    mask: usize,
}

unsafe impl Sync for LoomRing {}

impl LoomRing {
    fn new(cap: usize) -> Self {
        LoomRing {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            slots: (0..cap)
                .map(|i| Slot { seq: AtomicUsize::new(i), value: UnsafeCell::new(0) })
                .collect(),
            mask: cap - 1,
        }
    }

    fn try_enqueue(&self, v: usize) -> Result<usize, usize> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;
            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.value.with_mut(|p| unsafe { *p = v });
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(pos);
                    }
                    Err(cur) => pos = cur,
                }
            } else if diff < 0 {
                return Err(v);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    fn try_dequeue(&self) -> Option<usize> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;
            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let v = slot.value.with(|p| unsafe { *p });
                        slot.seq.store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(v);
                    }
                    Err(cur) => pos = cur,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    fn dequeue_stamp(&self) -> usize {
        self.head.load(Ordering::SeqCst)
    }

    fn has_ready(&self) -> bool {
        let pos = self.head.load(Ordering::Acquire);
        let seq = self.slots[pos & self.mask].seq.load(Ordering::Acquire);
        seq == pos.wrapping_add(1)
    }
}

#[test]
fn loom_ring_two_producers_exactly_once() {
    loom::model(|| {
        let ring = Arc::new(LoomRing::new(2));
        let producers: Vec<_> = [1usize, 2]
            .into_iter()
            .map(|v| {
                let ring = ring.clone();
                thread::spawn(move || {
                    let mut v = v;
                    while let Err(back) = ring.try_enqueue(v) {
                        v = back;
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let mut got = Vec::new();
        while got.len() < 2 {
            match ring.try_dequeue() {
                Some(v) => got.push(v),
                None => thread::yield_now(),
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        got.sort();
        assert_eq!(got, vec![1, 2]);
        assert!(ring.try_dequeue().is_none());
    });
}

#[test]
fn loom_ring_wraps_without_overwrite() {
    loom::model(|| {
        let ring = Arc::new(LoomRing::new(2));
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for v in 1..=3usize {
                    let mut v = v;
                    while let Err(back) = ring.try_enqueue(v) {
                        v = back;
                        thread::yield_now();
                    }
                }
            })
        };
        let mut got = Vec::new();
        while got.len() < 3 {
            match ring.try_dequeue() {
                Some(v) => got.push(v),
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    });
}

// ============================================================================
// Stamp/notify handshake
// ============================================================================

const SLEEPING: u64 = 1;
const STATE_BITS: u32 = 2;

fn pack(sleeping: bool, stamp: usize) -> u64 {
    ((stamp as u64) << STATE_BITS) | if sleeping { SLEEPING } else { 0 }
}

/// The consumer publishes "sleeping at stamp", re-checks the ring, and
/// only then waits on its permit. The producer enqueues, fences, and
/// grants the permit when the stamp matches its position. The model
/// asserts the consumer never commits to a sleep that nobody will end.
#[test]
fn loom_notify_no_lost_wakeup() {
    loom::model(|| {
        let ring = Arc::new(LoomRing::new(2));
        let status = Arc::new(AtomicU64::new(pack(false, 0)));
        let permit = Arc::new(AtomicBool::new(false));

        let producer = {
            let ring = ring.clone();
            let status = status.clone();
            let permit = permit.clone();
            thread::spawn(move || {
                let pos = ring.try_enqueue(7).unwrap();
                fence(Ordering::SeqCst);
                let word = status.load(Ordering::SeqCst);
                if word & SLEEPING != 0 && (word >> STATE_BITS) == pos as u64 {
                    permit.store(true, Ordering::Release);
                }
            })
        };

        let mut got = ring.try_dequeue();
        if got.is_none() {
            status.store(pack(true, ring.dequeue_stamp()), Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if !ring.has_ready() {
                // Committed to sleep: a wakeup must arrive.
                while !permit.load(Ordering::Acquire) {
                    thread::yield_now();
                }
            }
            status.store(pack(false, ring.dequeue_stamp()), Ordering::SeqCst);
            got = ring.try_dequeue();
        }
        producer.join().unwrap();
        assert_eq!(got, Some(7));
    });
}
