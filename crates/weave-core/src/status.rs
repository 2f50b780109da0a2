//! Context status word
//!
//! One 64-bit atomic packing the context's scheduling state into the low
//! two bits and its async-queue dequeue stamp into the remaining 62:
//!
//! ```text
//!   63                                   2 1 0
//!  +--------------------------------------+---+
//!  |          dequeue stamp (62)          |st |
//!  +--------------------------------------+---+
//! ```
//!
//! A context about to sleep publishes `(Polling|Waiting, head)` where
//! `head` is its inbound ring's consumer position, then re-checks the
//! ring. A producer that enqueued at position `pos` fences, reads the
//! word, and sends a wakeup only when the state is a sleeping one and
//! the stamp equals `pos`: exactly the case where the sleeper has not
//! seen that message. Earlier positions belong to earlier producers who
//! carry the same duty; later ones were already consumed.
//!
//! 62 bits of stamp cannot collide within one sleep period in practice;
//! stamps are compared after masking so ring positions that wrap the
//! full machine word still match.

use core::fmt;
use core::sync::atomic::{fence, AtomicU64, Ordering};

use crate::pad::CachePadded;

const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// Mask applied to stamps before packing or comparing
pub const STAMP_MASK: u64 = u64::MAX >> STATE_BITS;

/// Scheduling state of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    /// Executing fibers or draining calls
    Running = 0,
    /// Between cycles, polling without blocking
    Pending = 1,
    /// Blocked in the I/O backend; woken through the backend notifier
    Polling = 2,
    /// Parked on its own parker; woken by unpark
    Waiting = 3,
}

impl ContextState {
    #[inline]
    pub const fn is_sleeping(self) -> bool {
        matches!(self, ContextState::Polling | ContextState::Waiting)
    }

    #[inline]
    const fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            0 => ContextState::Running,
            1 => ContextState::Pending,
            2 => ContextState::Polling,
            _ => ContextState::Waiting,
        }
    }
}

/// Unpacked status snapshot
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: ContextState,
    /// Masked dequeue stamp
    pub stamp: u64,
}

impl Status {
    #[inline]
    pub fn new(state: ContextState, stamp: usize) -> Self {
        Status { state, stamp: stamp as u64 & STAMP_MASK }
    }

    #[inline]
    pub const fn pack(self) -> u64 {
        (self.stamp << STATE_BITS) | self.state as u64
    }

    #[inline]
    pub const fn unpack(word: u64) -> Self {
        Status { state: ContextState::from_bits(word), stamp: word >> STATE_BITS }
    }

    /// True if a producer that enqueued at `enqueue_stamp` owes a wakeup
    #[inline]
    pub fn needs_wakeup(self, enqueue_stamp: usize) -> bool {
        self.state.is_sleeping() && self.stamp == (enqueue_stamp as u64 & STAMP_MASK)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.state, self.stamp)
    }
}

/// The shared status word of one context
pub struct StatusWord {
    word: CachePadded<AtomicU64>,
}

impl StatusWord {
    pub fn new() -> Self {
        StatusWord {
            word: CachePadded::new(AtomicU64::new(Status::new(ContextState::Running, 0).pack())),
        }
    }

    #[inline]
    pub fn load(&self) -> Status {
        Status::unpack(self.word.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn state(&self) -> ContextState {
        self.load().state
    }

    /// Owner side: publish a new state with the current dequeue stamp.
    ///
    /// Followed by a full fence so the owner's subsequent re-check of
    /// its queue cannot be ordered before the publication.
    #[inline]
    pub fn publish(&self, state: ContextState, dequeue_stamp: usize) {
        self.word.store(Status::new(state, dequeue_stamp).pack(), Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Owner side: back to running, keeping the last stamp
    #[inline]
    pub fn set_running(&self) {
        let current = self.word.load(Ordering::Relaxed);
        let running = (current & !STATE_MASK) | ContextState::Running as u64;
        self.word.store(running, Ordering::SeqCst);
    }

    /// Producer side: after publishing a message at `enqueue_stamp`,
    /// decide whether the owner must be woken. Returns the sleeping state
    /// to wake from.
    #[inline]
    pub fn wakeup_needed(&self, enqueue_stamp: usize) -> Option<ContextState> {
        fence(Ordering::SeqCst);
        let status = self.load();
        status.needs_wakeup(enqueue_stamp).then_some(status.state)
    }
}

impl Default for StatusWord {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusWord({:?})", self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::Ring;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_pack_roundtrip() {
        for state in [
            ContextState::Running,
            ContextState::Pending,
            ContextState::Polling,
            ContextState::Waiting,
        ] {
            let s = Status::new(state, 123_456);
            assert_eq!(Status::unpack(s.pack()), s);
        }
    }

    #[test]
    fn test_wakeup_rules() {
        let word = StatusWord::new();
        assert_eq!(word.wakeup_needed(0), None);

        word.publish(ContextState::Waiting, 7);
        assert_eq!(word.wakeup_needed(7), Some(ContextState::Waiting));
        // Earlier producer owns the wakeup; later one was never seen by a
        // sleeper at 7 either, but the producer at 7 will wake it.
        assert_eq!(word.wakeup_needed(6), None);
        assert_eq!(word.wakeup_needed(8), None);

        word.publish(ContextState::Pending, 7);
        assert_eq!(word.wakeup_needed(7), None);

        word.publish(ContextState::Polling, 9);
        word.set_running();
        assert_eq!(word.load(), Status::new(ContextState::Running, 9));
    }

    #[test]
    fn test_stamp_wraparound() {
        let word = StatusWord::new();
        // Stamps beyond 62 bits are masked identically on both sides.
        let big = usize::MAX - 1;
        word.publish(ContextState::Waiting, big);
        assert_eq!(word.wakeup_needed(big), Some(ContextState::Waiting));
        assert_eq!(word.wakeup_needed(big.wrapping_add(1)), None);

        // Ring positions that wrap past usize::MAX still line up with the
        // published stamp.
        let ring = Ring::with_initial_position(4, usize::MAX);
        let pos = ring.try_enqueue(1u8).unwrap();
        assert_eq!(pos, usize::MAX);
        ring.try_dequeue().unwrap();
        word.publish(ContextState::Polling, ring.dequeue_stamp());
        let pos = ring.try_enqueue(2u8).unwrap();
        assert_eq!(pos, 0);
        assert_eq!(word.wakeup_needed(pos), Some(ContextState::Polling));
    }

    /// One consumer repeatedly goes to sleep while producers race to send
    /// it messages. A lost wakeup would leave the consumer asleep with a
    /// message queued; we detect it as a sleep outlasting the deadline.
    #[test]
    fn test_no_lost_wakeups() {
        const PRODUCERS: usize = 4;
        const PER: usize = 5_000;
        let ring = Arc::new(Ring::<usize>::with_capacity(16));
        let word = Arc::new(StatusWord::new());
        let permit = Arc::new(AtomicBool::new(false));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = Arc::clone(&ring);
                let word = Arc::clone(&word);
                let permit = Arc::clone(&permit);
                thread::spawn(move || {
                    let mut last = 0usize;
                    for i in 0..PER {
                        let mut v = p * PER + i;
                        let pos = loop {
                            match ring.try_enqueue(v) {
                                Ok(pos) => break pos,
                                Err(back) => {
                                    v = back;
                                    thread::yield_now();
                                }
                            }
                        };
                        if word.wakeup_needed(pos).is_some() {
                            permit.store(true, Ordering::Release);
                        }
                        // Racing with a stale stamp may only cause a
                        // spurious wakeup, never suppress a needed one.
                        if i > 0 && word.wakeup_needed(last).is_some() {
                            permit.store(true, Ordering::Release);
                        }
                        last = pos;
                    }
                })
            })
            .collect();

        let mut received = 0;
        while received < PRODUCERS * PER {
            while ring.try_dequeue().is_some() {
                received += 1;
            }
            if received == PRODUCERS * PER {
                break;
            }
            word.publish(ContextState::Waiting, ring.dequeue_stamp());
            if ring.has_ready() {
                word.set_running();
                continue;
            }
            let deadline = Instant::now() + Duration::from_secs(5);
            while !permit.swap(false, Ordering::Acquire) {
                assert!(Instant::now() < deadline, "lost wakeup after {} items", received);
                std::hint::spin_loop();
            }
            word.set_running();
        }

        for h in producers {
            h.join().unwrap();
        }
        assert_eq!(received, PRODUCERS * PER);
    }
}
