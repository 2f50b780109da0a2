//! # weave-core
//!
//! Core data structures for the weave fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Stack switching, parking, the I/O backend and everything that binds a
//! structure to an OS thread live in `weave-runtime`.
//!
//! ## Modules
//!
//! - `ring` - Lock-free MPMC ring of fixed-size slots (cross-thread messaging)
//! - `runq` - Priority-bucketed run queue with a find-first-set bitmap
//! - `task` - Task descriptors and the per-context segmented task list
//! - `status` - Context status word (state bits + dequeue stamp)
//! - `timeq` - Approximate timer priority queue
//! - `epoch` - Epoch-based deferred reclamation
//! - `state` - Fiber state, flags and priority types
//! - `id` - Fiber identifier type
//! - `error` - Error types
//! - `spinlock` - Internal spinlock primitive
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod kprint;
pub mod env;
pub mod error;
pub mod id;
pub mod state;
pub mod spinlock;
pub mod pad;
pub mod ring;
pub mod runq;
pub mod status;
pub mod task;
pub mod timeq;
pub mod epoch;

// Re-exports for convenience
pub use id::FiberId;
pub use state::{FiberFlags, FiberState, Priority};
pub use error::{Canceled, ConfigError, MemoryError, WeaveError, WeaveResult};
pub use spinlock::SpinLock;
pub use pad::CachePadded;
pub use ring::Ring;
pub use runq::RunQueue;
pub use status::{ContextState, Status, StatusWord};
pub use task::{Task, TaskList, TaskRoutine};
pub use timeq::{TimerHandle, TimerQueue};
pub use epoch::{EpochCollector, EpochSlot, RetireList};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Constants shared across the runtime
pub mod constants {
    /// Number of run-queue priority levels
    pub const PRIORITY_LEVELS: usize = 32;

    /// Guard page size below every fiber stack
    pub const GUARD_SIZE: usize = 4096;

    /// Smallest fiber stack accepted by the runtime
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Machine words carried by one async call
    pub const CALL_ARGS: usize = 6;

    /// Tasks per task-list segment
    pub const TASK_SEGMENT: usize = 64;

    /// Events packed into one forwarding call
    pub const FORWARD_BATCH: usize = CALL_ARGS;

    /// Context index sentinel ("not a context thread")
    pub const CONTEXT_NONE: u32 = u32::MAX;
}
