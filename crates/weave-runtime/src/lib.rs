//! # weave-runtime
//!
//! Platform-specific runtime for the weave fiber scheduler.
//!
//! This crate provides:
//! - Guarded fiber stacks (mmap + PROT_NONE guard page)
//! - Context switching (naked assembly for x86_64 and aarch64)
//! - Strands: per-thread cooperative schedulers with a worker pool
//! - Execution contexts bound to OS threads, talking through async calls
//! - A shared I/O backend (epoll on Linux), per-context listeners with
//!   timer queues, and epoch-based sink reclamation
//! - Task balancing between contexts (stealing and distribution)

pub mod config;
pub mod arch;
pub mod memory;
pub mod parking;
pub mod tls;
pub mod fiber;
pub mod strand;
pub mod call;
pub mod request;
pub mod cache;
pub mod balance;
pub mod backend;
pub mod sink;
pub mod listener;
pub mod dispatcher;
pub mod context;
pub mod api;

// Re-exports
pub use config::RuntimeConfig;
pub use arch::Continuation;
pub use fiber::{Fiber, FiberResult};
pub use strand::{Census, Strand, StrandStats};
pub use call::{CallFrame, CallRoutine};
pub use request::RequestRoutine;
pub use cache::{CacheBlock, LocalCache};
pub use backend::{EventBackend, Interest};
pub use sink::{EventSink, SinkHandler};
pub use listener::{Listener, TimerAction};
pub use dispatcher::Dispatcher;
pub use context::{AttachGuard, Context, ContextStats, FiberRef};
pub use parking::{ContextParking, PlatformParker};
