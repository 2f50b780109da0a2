//! Context parking
//!
//! A context with nothing to do and no poller duty parks on its own
//! parker. Producers that find it in the `Waiting` state unpark it. The
//! parker carries a single permit, so an unpark that lands before the
//! park is not lost.

use std::time::Duration;

/// Permit-based sleep/wake for one owner thread
pub trait ContextParking: Send + Sync {
    /// Sleep until unparked or `timeout` passes.
    ///
    /// Consumes a pending permit immediately if one is set. Returns `true`
    /// when a permit was consumed, `false` on timeout or spurious return.
    /// Callers re-check their queues either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Grant the permit and wake the owner if it is asleep
    fn unpark(&self);
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParker as PlatformParker;
    } else {
        mod fallback;
        pub use fallback::CondvarParker as PlatformParker;
    }
}
