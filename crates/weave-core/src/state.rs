//! Fiber state, flags and priority types

use core::fmt;

use crate::constants::PRIORITY_LEVELS;

/// Execution state of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Parked on some wait condition; must be woken with `run`
    Blocked = 0,

    /// Runnable, sitting in the run queue
    Pending = 1,

    /// Currently executing (at most one per strand)
    Running = 2,

    /// Exited; on the dead list awaiting reuse
    Invalid = 3,
}

impl FiberState {
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Pending | FiberState::Running)
    }

    #[inline]
    pub const fn is_dead(&self) -> bool {
        matches!(self, FiberState::Invalid)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Blocked,
            1 => FiberState::Pending,
            2 => FiberState::Running,
            _ => FiberState::Invalid,
        }
    }
}

/// Fiber flag bits
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FiberFlags(u8);

impl FiberFlags {
    /// Blocked on an explicit wait (sink, request, pause)
    pub const WAITING: FiberFlags = FiberFlags(1 << 0);
    pub const CANCEL_REQUESTED: FiberFlags = FiberFlags(1 << 1);
    pub const CANCEL_DISABLED: FiberFlags = FiberFlags(1 << 2);
    pub const CANCEL_OCCURRED: FiberFlags = FiberFlags(1 << 3);
    /// Member of the strand's worker pool
    pub const WORKER: FiberFlags = FiberFlags(1 << 4);
    /// Worker parked on the strand's idle queue
    pub const IDLE: FiberFlags = FiberFlags(1 << 5);

    pub const fn empty() -> Self {
        FiberFlags(0)
    }

    #[inline]
    pub const fn contains(self, other: FiberFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn with(self, other: FiberFlags) -> Self {
        FiberFlags(self.0 | other.0)
    }

    #[inline]
    pub const fn without(self, other: FiberFlags) -> Self {
        FiberFlags(self.0 & !other.0)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// A pending cancel that `testcancel` would act on
    #[inline]
    pub const fn cancel_due(self) -> bool {
        self.contains(Self::CANCEL_REQUESTED)
            && !self.contains(Self::CANCEL_DISABLED)
            && !self.contains(Self::CANCEL_OCCURRED)
    }
}

impl fmt::Debug for FiberFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::WAITING, "WAITING"),
            (Self::CANCEL_REQUESTED, "CANCEL_REQUESTED"),
            (Self::CANCEL_DISABLED, "CANCEL_DISABLED"),
            (Self::CANCEL_OCCURRED, "CANCEL_OCCURRED"),
            (Self::WORKER, "WORKER"),
            (Self::IDLE, "IDLE"),
        ];
        let mut first = true;
        write!(f, "FiberFlags(")?;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// Scheduling priority. 0 is the highest, `PRIORITY_LEVELS - 1` the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const LOWEST: Priority = Priority(PRIORITY_LEVELS as u8 - 1);
    /// Default for user fibers
    pub const DEFAULT: Priority = Priority(16);
    /// Worker fibers and the master share one bucket so `yield`
    /// round-robins between them.
    pub const WORKER: Priority = Priority(16);
    pub const MASTER: Priority = Priority::WORKER;

    /// Clamps to the valid range
    #[inline]
    pub const fn new(level: u8) -> Self {
        if level as usize >= PRIORITY_LEVELS {
            Priority::LOWEST
        } else {
            Priority(level)
        }
    }

    #[inline]
    pub const fn level(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// The more urgent of two priorities
    #[inline]
    pub fn upper(self, other: Priority) -> Priority {
        if other.0 < self.0 { other } else { self }
    }

    #[inline]
    pub const fn is_higher_than(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}
