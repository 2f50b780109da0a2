//! # weave
//!
//! Fiber runtime: one cooperative scheduler per OS thread, lock-free
//! async calls between threads, a shared event dispatcher and work
//! stealing between contexts.
//!
//! ## Quick Start
//!
//! ```ignore
//! use weave::{Runtime, RuntimeConfig, api};
//!
//! fn main() -> weave::WeaveResult<()> {
//!     let mut runtime = Runtime::new(RuntimeConfig::from_env())?;
//!     let answer = runtime.block_on(|| {
//!         let child = api::fiber_spawn(|| Ok(41)).unwrap();
//!         api::fiber_join(child.fiber).unwrap().unwrap() + 1
//!     })?;
//!     assert_eq!(answer, 42);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        api::fiber_*, api::call_N, api::event_*, tasks       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Dispatcher                             │
//! │      backend (epoll), poll lock, epoch, sink table          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Context 0 │ ◄──► │ Context 1 │ ◄──► │ Context N │   async calls
//!    │  strand   │      │  strand   │      │  strand   │   over rings
//!    │  listener │      │  listener │      │  listener │
//!    └───────────┘      └───────────┘      └───────────┘
//!      OS thread          OS thread          OS thread
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

// Re-export core types
pub use weave_core::{
    Canceled, ContextState, FiberFlags, FiberId, FiberState, Priority, Task, TaskRoutine, TimerHandle,
    WeaveError, WeaveResult,
};

// Re-export kprint macros for logging
pub use weave_core::{fatal, kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use weave_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use weave_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use weave_runtime::{
    api, CacheBlock, Context, ContextStats, Dispatcher, EventSink, FiberRef, FiberResult, Interest,
    RuntimeConfig, SinkHandler, TimerAction,
};

/// Owns a dispatcher and the OS threads running its contexts
pub struct Runtime {
    dispatcher: Arc<Dispatcher>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    /// Build the contexts. Nothing runs until [`start`](Self::start).
    pub fn new(config: RuntimeConfig) -> WeaveResult<Self> {
        weave_core::kprint::init();
        Ok(Runtime { dispatcher: Dispatcher::new(config)?, threads: Vec::new() })
    }

    /// Configuration from the environment on top of the defaults
    pub fn from_env() -> WeaveResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_started(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Start one OS thread per context
    pub fn start(&mut self) -> WeaveResult<()> {
        if self.is_started() {
            return Err(WeaveError::AlreadyStarted);
        }
        for index in 0..self.dispatcher.len() as u32 {
            let d = self.dispatcher.clone();
            let handle = thread::Builder::new()
                .name(format!("weave-ctx-{}", index))
                .spawn(move || d.context(index).run())?;
            self.threads.push(handle);
        }
        kinfo!("runtime started with {} contexts", self.threads.len());
        Ok(())
    }

    /// Ask every context to leave its run loop
    pub fn stop(&self) {
        self.dispatcher.stop();
    }

    /// Wait for every context thread to finish
    pub fn join(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                kerror!("a context thread panicked");
            }
        }
    }

    /// Start a fiber on context `index`
    pub fn spawn_on<F>(&self, index: u32, body: F) -> WeaveResult<()>
    where
        F: FnOnce() -> FiberResult + Send + 'static,
    {
        if index as usize >= self.dispatcher.len() {
            return Err(WeaveError::WrongContext);
        }
        self.dispatcher.context(index).spawn_fiber(body);
        Ok(())
    }

    /// Queue a task on context `index`
    pub fn send_task(&self, index: u32, task: Task) -> WeaveResult<()> {
        if index as usize >= self.dispatcher.len() {
            task.discard();
            return Err(WeaveError::WrongContext);
        }
        self.dispatcher.context(index).send_task(task);
        Ok(())
    }

    /// Run `f` in a fiber on context 0 and wait for its value. Starts the
    /// runtime if needed; the runtime keeps running afterwards.
    pub fn block_on<F, T>(&mut self, f: F) -> WeaveResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_started() {
            self.start()?;
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.spawn_on(0, move || {
            let _ = tx.send(f());
            Ok(0)
        })?;
        rx.recv().map_err(|_| WeaveError::Stopped)
    }

    /// Counter snapshot of every context
    pub fn stats(&self) -> Vec<ContextStats> {
        self.dispatcher.contexts().iter().map(Context::stats).collect()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.is_started() {
            self.stop();
            self.join();
        }
    }
}
