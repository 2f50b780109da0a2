//! I/O readiness backend
//!
//! One backend is shared by every listener of a dispatcher. Only the
//! listener holding the poll lock calls [`EventBackend::poll`]; any
//! thread may register, unregister or notify.
//!
//! Registrations carry an opaque `usize` token (the sink's address). The
//! token 0 is reserved for the backend's own wakeup channel and is never
//! reported.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness bits reported per event
pub mod bits {
    pub const IN: usize = 1 << 0;
    pub const OUT: usize = 1 << 1;
    pub const IN_CLOSED: usize = 1 << 2;
    pub const OUT_CLOSED: usize = 1 << 3;
    pub const ERR: usize = 1 << 4;

    /// Every bit above; fits below a 64-byte aligned pointer
    pub const MASK: usize = 0x3F;
}

/// What a registration asks to be told about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
    /// Report once, then stay silent until re-armed
    pub oneshot: bool,
}

impl Interest {
    pub const READ: Interest = Interest { readable: true, writable: false, oneshot: false };
    pub const WRITE: Interest = Interest { readable: false, writable: true, oneshot: false };
    pub const BOTH: Interest = Interest { readable: true, writable: true, oneshot: false };

    pub const fn oneshot(self) -> Self {
        Interest { oneshot: true, ..self }
    }
}

/// One readiness report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendEvent {
    pub token: usize,
    pub bits: usize,
}

pub trait EventBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    /// Re-enable a oneshot registration
    fn rearm(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()>;

    fn unregister(&self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout` (`None` = forever) and append reports to
    /// `events`. Returns the number appended; an interrupted wait is 0.
    fn poll(&self, events: &mut Vec<BackendEvent>, timeout: Option<Duration>) -> io::Result<usize>;

    /// Make a concurrent or the next `poll` return promptly. Never blocks.
    fn notify(&self) -> io::Result<()>;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::EpollBackend;
    }
}

mod fallback;
pub use fallback::NotifyOnlyBackend;

/// The best backend available on this platform
pub fn platform_backend() -> io::Result<Box<dyn EventBackend>> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            Ok(Box::new(EpollBackend::new()?))
        } else {
            Ok(Box::new(NotifyOnlyBackend::new()))
        }
    }
}
