//! Error types for the weave runtime

use core::fmt;

/// Result type for runtime operations
pub type WeaveResult<T> = Result<T, WeaveError>;

/// Cooperative cancellation marker.
///
/// Returned by `testcancel` and friends; propagate it with `?` up to the
/// fiber entry, which then finishes with the canceled result. Not an
/// error in the failure sense: cleanup handlers run exactly as on a
/// normal return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber canceled")
    }
}

impl std::error::Error for Canceled {}

/// Errors surfaced by runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeaveError {
    /// The calling fiber was canceled
    Canceled,

    /// Operation timed out
    Timeout,

    /// Async call ring had no free slot (trycall)
    RingFull,

    /// Caller is not running on a context thread
    NotOnContext,

    /// Operation must run on the owning context
    WrongContext,

    /// Fiber id is stale or unknown
    InvalidFiber,

    /// Object is in the wrong state for the operation
    InvalidState,

    /// Runtime already started
    AlreadyStarted,

    /// Runtime or context is stopping
    Stopped,

    /// Invalid configuration
    Config(ConfigError),

    /// Stack or cache memory failure
    Memory(MemoryError),

    /// OS error (errno)
    Io(i32),

    /// Not supported by the active backend
    Unsupported,
}

impl fmt::Display for WeaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeaveError::Canceled => write!(f, "fiber canceled"),
            WeaveError::Timeout => write!(f, "operation timed out"),
            WeaveError::RingFull => write!(f, "async call ring full"),
            WeaveError::NotOnContext => write!(f, "not running on a context thread"),
            WeaveError::WrongContext => write!(f, "operation requires the owning context"),
            WeaveError::InvalidFiber => write!(f, "invalid or stale fiber id"),
            WeaveError::InvalidState => write!(f, "invalid state for operation"),
            WeaveError::AlreadyStarted => write!(f, "runtime already started"),
            WeaveError::Stopped => write!(f, "runtime stopped"),
            WeaveError::Config(e) => write!(f, "config error: {}", e),
            WeaveError::Memory(e) => write!(f, "memory error: {}", e),
            WeaveError::Io(code) => write!(f, "os error {}", code),
            WeaveError::Unsupported => write!(f, "unsupported by event backend"),
        }
    }
}

impl std::error::Error for WeaveError {}

impl From<Canceled> for WeaveError {
    fn from(_: Canceled) -> Self {
        WeaveError::Canceled
    }
}

impl From<std::io::Error> for WeaveError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::Unsupported => WeaveError::Unsupported,
            std::io::ErrorKind::TimedOut => WeaveError::Timeout,
            _ => WeaveError::Io(e.raw_os_error().unwrap_or(0)),
        }
    }
}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    MapFailed(i32),

    /// mprotect on the guard page failed
    ProtectFailed(i32),

    /// Requested size overflowed after rounding
    SizeOverflow,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::MapFailed(e) => write!(f, "mmap failed (errno {})", e),
            MemoryError::ProtectFailed(e) => write!(f, "guard page mprotect failed (errno {})", e),
            MemoryError::SizeOverflow => write!(f, "size overflow"),
        }
    }
}

impl From<MemoryError> for WeaveError {
    fn from(e: MemoryError) -> Self {
        WeaveError::Memory(e)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoContexts,
    QueueTooSmall(usize),
    WorkerBounds { min: usize, max: usize },
    StackTooSmall(usize),
    ZeroBatch(&'static str),
    NoTimerBuckets,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoContexts => write!(f, "at least one context is required"),
            ConfigError::QueueTooSmall(n) => write!(f, "async queue size {} is below 2", n),
            ConfigError::WorkerBounds { min, max } => {
                write!(f, "workers_min {} exceeds workers_max {}", min, max)
            }
            ConfigError::StackTooSmall(n) => write!(f, "stack size {} is below the minimum", n),
            ConfigError::ZeroBatch(name) => write!(f, "{} must be non-zero", name),
            ConfigError::NoTimerBuckets => write!(f, "timer queue needs at least one bucket"),
        }
    }
}

impl From<ConfigError> for WeaveError {
    fn from(e: ConfigError) -> Self {
        WeaveError::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", WeaveError::RingFull), "async call ring full");
        let e = WeaveError::Memory(MemoryError::MapFailed(12));
        assert_eq!(format!("{}", e), "memory error: mmap failed (errno 12)");
    }

    #[test]
    fn test_conversions() {
        let e: WeaveError = Canceled.into();
        assert_eq!(e, WeaveError::Canceled);

        let e: WeaveError = ConfigError::WorkerBounds { min: 4, max: 2 }.into();
        assert!(matches!(e, WeaveError::Config(ConfigError::WorkerBounds { min: 4, max: 2 })));

        let io = std::io::Error::from_raw_os_error(9);
        assert_eq!(WeaveError::from(io), WeaveError::Io(9));
    }
}
