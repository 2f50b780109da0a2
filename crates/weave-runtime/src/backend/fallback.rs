//! Backend without fd readiness support
//!
//! Poll is a timed wait that `notify` cuts short. Timers, async calls and
//! parking all work on top of it; registering a descriptor does not.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::{BackendEvent, EventBackend, Interest};

pub struct NotifyOnlyBackend {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl NotifyOnlyBackend {
    pub fn new() -> Self {
        NotifyOnlyBackend { pending: Mutex::new(false), condvar: Condvar::new() }
    }
}

impl Default for NotifyOnlyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBackend for NotifyOnlyBackend {
    fn name(&self) -> &'static str {
        "notify-only"
    }

    fn register(&self, _fd: RawFd, _token: usize, _interest: Interest) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn rearm(&self, _fd: RawFd, _token: usize, _interest: Interest) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn unregister(&self, _fd: RawFd) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn poll(&self, _events: &mut Vec<BackendEvent>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !*pending {
            pending = match timeout {
                Some(t) if t.is_zero() => pending,
                Some(t) => {
                    self.condvar
                        .wait_timeout(pending, t)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.condvar.wait(pending).unwrap_or_else(PoisonError::into_inner),
            };
        }
        *pending = false;
        Ok(0)
    }

    fn notify(&self) -> io::Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        self.condvar.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unsupported() {
        let backend = NotifyOnlyBackend::new();
        let err = backend.register(0, 1, Interest::READ).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_zero_timeout_returns() {
        let backend = NotifyOnlyBackend::new();
        let mut events = Vec::new();
        assert_eq!(backend.poll(&mut events, Some(Duration::ZERO)).unwrap(), 0);
    }
}
