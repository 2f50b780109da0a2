//! Linux futex parker
//!
//! Futex word: 0 = no permit, 1 = permit granted.
//!
//! park:   take the permit if set; otherwise FUTEX_WAIT while the word is
//!         0, then take whatever permit arrived.
//! unpark: set the permit; FUTEX_WAKE only on the 0 -> 1 transition.
//!
//! The kernel compares the word atomically with queueing the waiter, so
//! an unpark between the first check and the wait makes the wait return
//! EAGAIN instead of sleeping.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::ContextParking;

pub struct FutexParker {
    permit: AtomicU32,
}

impl FutexParker {
    pub fn new() -> Self {
        FutexParker { permit: AtomicU32::new(0) }
    }

    fn futex_wait(&self, timeout: Option<Duration>) {
        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };
        // ETIMEDOUT, EAGAIN and EINTR all mean "go re-check".
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.permit.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn futex_wake(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.permit.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParker {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextParking for FutexParker {
    fn park(&self, timeout: Option<Duration>) -> bool {
        if self.permit.swap(0, Ordering::Acquire) == 1 {
            return true;
        }
        self.futex_wait(timeout);
        self.permit.swap(0, Ordering::Acquire) == 1
    }

    fn unpark(&self) {
        if self.permit.swap(1, Ordering::Release) == 0 {
            self.futex_wake();
        }
    }
}
