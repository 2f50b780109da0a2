//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder setters
//! 2. Environment variables (`from_env`)
//! 3. The file named by `WEAVE_CONFIG_RS` at build time
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use weave_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .contexts(8)
//!     .poll_timeout(Duration::from_millis(5));
//! config.validate()?;
//! ```

/// Compile-time defaults generated by build.rs
pub mod defaults {
    include!(concat!(env!("OUT_DIR"), "/weave_merged_config.rs"));
}

use std::time::Duration;

use weave_core::constants::MIN_STACK_SIZE;
use weave_core::env::{env_get, env_get_micros};
use weave_core::ConfigError;

/// Runtime configuration with builder setters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Execution contexts (one OS thread each)
    pub contexts: usize,
    /// Inbound async-call ring slots per context (rounded to a power of two)
    pub async_queue_size: usize,
    /// Worker fibers started with each strand
    pub workers_min: usize,
    /// Upper bound on worker fibers per strand
    pub workers_max: usize,
    /// Usable stack bytes per fiber (a guard page is added below)
    pub stack_size: usize,
    /// Zero-timeout polls after a productive poll before blocking
    pub spin_limit: u32,
    /// Ceiling for one blocking poll
    pub poll_timeout: Duration,
    /// Tasks asked of the busiest peer per request
    pub steal_batch: usize,
    /// Task-list length above which a context pushes work to a peer
    pub distribute_threshold: usize,
    /// Most tasks pushed by one distribution
    pub distribute_batch: usize,
    /// Starved master cycles before another worker is spawned
    pub worker_spawn_cycles: u32,
    /// Tasks a worker runs before yielding to the master
    pub worker_yield_interval: u32,
    /// Dead fibers kept for stack reuse
    pub dead_fiber_limit: usize,
    /// Cached blocks per size class
    pub cache_limit: usize,
    /// Near buckets in each listener's timer queue
    pub timer_buckets: usize,
    /// Width of one timer bucket
    pub timer_resolution: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `WEAVE_CONTEXTS`
    /// - `WEAVE_ASYNC_QUEUE_SIZE`
    /// - `WEAVE_WORKERS_MIN`, `WEAVE_WORKERS_MAX`
    /// - `WEAVE_STACK_SIZE`
    /// - `WEAVE_SPIN_LIMIT`
    /// - `WEAVE_POLL_TIMEOUT_US`
    /// - `WEAVE_STEAL_BATCH`
    /// - `WEAVE_DISTRIBUTE_THRESHOLD`, `WEAVE_DISTRIBUTE_BATCH`
    /// - `WEAVE_WORKER_SPAWN_CYCLES`
    /// - `WEAVE_WORKER_YIELD_INTERVAL`
    /// - `WEAVE_DEAD_FIBER_LIMIT`
    /// - `WEAVE_CACHE_LIMIT`
    /// - `WEAVE_TIMER_BUCKETS`, `WEAVE_TIMER_RESOLUTION_US`
    pub fn from_env() -> Self {
        Self {
            contexts: env_get("WEAVE_CONTEXTS", defaults::CONTEXTS),
            async_queue_size: env_get("WEAVE_ASYNC_QUEUE_SIZE", defaults::ASYNC_QUEUE_SIZE),
            workers_min: env_get("WEAVE_WORKERS_MIN", defaults::WORKERS_MIN),
            workers_max: env_get("WEAVE_WORKERS_MAX", defaults::WORKERS_MAX),
            stack_size: env_get("WEAVE_STACK_SIZE", defaults::STACK_SIZE),
            spin_limit: env_get("WEAVE_SPIN_LIMIT", defaults::SPIN_LIMIT),
            poll_timeout: env_get_micros("WEAVE_POLL_TIMEOUT_US", defaults::POLL_TIMEOUT_US),
            steal_batch: env_get("WEAVE_STEAL_BATCH", defaults::STEAL_BATCH),
            distribute_threshold: env_get(
                "WEAVE_DISTRIBUTE_THRESHOLD",
                defaults::DISTRIBUTE_THRESHOLD,
            ),
            distribute_batch: env_get("WEAVE_DISTRIBUTE_BATCH", defaults::DISTRIBUTE_BATCH),
            worker_spawn_cycles: env_get(
                "WEAVE_WORKER_SPAWN_CYCLES",
                defaults::WORKER_SPAWN_CYCLES,
            ),
            worker_yield_interval: env_get(
                "WEAVE_WORKER_YIELD_INTERVAL",
                defaults::WORKER_YIELD_INTERVAL,
            ),
            dead_fiber_limit: env_get("WEAVE_DEAD_FIBER_LIMIT", defaults::DEAD_FIBER_LIMIT),
            cache_limit: env_get("WEAVE_CACHE_LIMIT", defaults::CACHE_LIMIT),
            timer_buckets: env_get("WEAVE_TIMER_BUCKETS", defaults::TIMER_BUCKETS),
            timer_resolution: env_get_micros(
                "WEAVE_TIMER_RESOLUTION_US",
                defaults::TIMER_RESOLUTION_US,
            ),
        }
    }

    /// Create config with compile-time defaults only (no env override).
    /// Useful for tests that must not see the caller's environment.
    pub fn new() -> Self {
        Self {
            contexts: defaults::CONTEXTS,
            async_queue_size: defaults::ASYNC_QUEUE_SIZE,
            workers_min: defaults::WORKERS_MIN,
            workers_max: defaults::WORKERS_MAX,
            stack_size: defaults::STACK_SIZE,
            spin_limit: defaults::SPIN_LIMIT,
            poll_timeout: Duration::from_micros(defaults::POLL_TIMEOUT_US),
            steal_batch: defaults::STEAL_BATCH,
            distribute_threshold: defaults::DISTRIBUTE_THRESHOLD,
            distribute_batch: defaults::DISTRIBUTE_BATCH,
            worker_spawn_cycles: defaults::WORKER_SPAWN_CYCLES,
            worker_yield_interval: defaults::WORKER_YIELD_INTERVAL,
            dead_fiber_limit: defaults::DEAD_FIBER_LIMIT,
            cache_limit: defaults::CACHE_LIMIT,
            timer_buckets: defaults::TIMER_BUCKETS,
            timer_resolution: Duration::from_micros(defaults::TIMER_RESOLUTION_US),
        }
    }

    // Builder methods

    pub fn contexts(mut self, n: usize) -> Self {
        self.contexts = n;
        self
    }

    pub fn async_queue_size(mut self, n: usize) -> Self {
        self.async_queue_size = n;
        self
    }

    pub fn workers_min(mut self, n: usize) -> Self {
        self.workers_min = n;
        self
    }

    pub fn workers_max(mut self, n: usize) -> Self {
        self.workers_max = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn spin_limit(mut self, spins: u32) -> Self {
        self.spin_limit = spins;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn steal_batch(mut self, n: usize) -> Self {
        self.steal_batch = n;
        self
    }

    pub fn distribute_threshold(mut self, n: usize) -> Self {
        self.distribute_threshold = n;
        self
    }

    pub fn distribute_batch(mut self, n: usize) -> Self {
        self.distribute_batch = n;
        self
    }

    pub fn worker_spawn_cycles(mut self, n: u32) -> Self {
        self.worker_spawn_cycles = n;
        self
    }

    pub fn worker_yield_interval(mut self, n: u32) -> Self {
        self.worker_yield_interval = n;
        self
    }

    pub fn dead_fiber_limit(mut self, n: usize) -> Self {
        self.dead_fiber_limit = n;
        self
    }

    pub fn cache_limit(mut self, n: usize) -> Self {
        self.cache_limit = n;
        self
    }

    pub fn timer_buckets(mut self, n: usize) -> Self {
        self.timer_buckets = n;
        self
    }

    pub fn timer_resolution(mut self, d: Duration) -> Self {
        self.timer_resolution = d;
        self
    }

    /// Validate configuration and return the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.contexts == 0 {
            return Err(ConfigError::NoContexts);
        }
        if self.async_queue_size < 2 {
            return Err(ConfigError::QueueTooSmall(self.async_queue_size));
        }
        if self.workers_min > self.workers_max {
            return Err(ConfigError::WorkerBounds {
                min: self.workers_min,
                max: self.workers_max,
            });
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall(self.stack_size));
        }
        if self.steal_batch == 0 {
            return Err(ConfigError::ZeroBatch("steal_batch"));
        }
        if self.distribute_batch == 0 {
            return Err(ConfigError::ZeroBatch("distribute_batch"));
        }
        if self.worker_yield_interval == 0 {
            return Err(ConfigError::ZeroBatch("worker_yield_interval"));
        }
        if self.timer_buckets == 0 {
            return Err(ConfigError::NoTimerBuckets);
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("weave configuration:");
        eprintln!("  contexts:               {}", self.contexts);
        eprintln!("  async_queue_size:       {}", self.async_queue_size);
        eprintln!("  workers:                {}..={}", self.workers_min, self.workers_max);
        eprintln!("  stack_size:             {}", self.stack_size);
        eprintln!("  spin_limit:             {}", self.spin_limit);
        eprintln!("  poll_timeout:           {:?}", self.poll_timeout);
        eprintln!("  steal_batch:            {}", self.steal_batch);
        eprintln!("  distribute:             >{} by {}", self.distribute_threshold, self.distribute_batch);
        eprintln!("  worker_spawn_cycles:    {}", self.worker_spawn_cycles);
        eprintln!("  worker_yield_interval:  {}", self.worker_yield_interval);
        eprintln!("  dead_fiber_limit:       {}", self.dead_fiber_limit);
        eprintln!("  cache_limit:            {}", self.cache_limit);
        eprintln!("  timer:                  {} x {:?}", self.timer_buckets, self.timer_resolution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::new();
        assert_eq!(config.contexts, defaults::CONTEXTS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .contexts(2)
            .poll_timeout(Duration::from_millis(5))
            .workers_min(0)
            .workers_max(3);
        assert_eq!(config.contexts, 2);
        assert_eq!(config.poll_timeout, Duration::from_millis(5));
        assert_eq!((config.workers_min, config.workers_max), (0, 3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let base = RuntimeConfig::new();
        assert_eq!(base.clone().contexts(0).validate(), Err(ConfigError::NoContexts));
        assert_eq!(
            base.clone().async_queue_size(1).validate(),
            Err(ConfigError::QueueTooSmall(1))
        );
        assert_eq!(
            base.clone().workers_min(5).workers_max(2).validate(),
            Err(ConfigError::WorkerBounds { min: 5, max: 2 })
        );
        assert!(matches!(
            base.clone().stack_size(1024).validate(),
            Err(ConfigError::StackTooSmall(1024))
        ));
        assert_eq!(
            base.clone().steal_batch(0).validate(),
            Err(ConfigError::ZeroBatch("steal_batch"))
        );
        assert_eq!(base.timer_buckets(0).validate(), Err(ConfigError::NoTimerBuckets));
    }

    #[test]
    fn test_from_env_reads_overrides() {
        // Variables private to this test so parallel tests are unaffected.
        std::env::set_var("WEAVE_CACHE_LIMIT", "7");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("WEAVE_CACHE_LIMIT");
        assert_eq!(config.cache_limit, 7);
    }
}
