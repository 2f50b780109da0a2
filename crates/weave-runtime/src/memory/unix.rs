//! Unix stack mapping using mmap

use std::ptr;

use nix::errno::Errno;
use weave_core::constants::GUARD_SIZE;
use weave_core::MemoryError;

use super::{note_mapped, note_unmapped};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        const MAP_FLAGS: libc::c_int =
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK;
    } else {
        const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;
    }
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// One mapped fiber stack
///
/// ```text
///   base                base+guard                         base+len
///    | guard (PROT_NONE) |  usable, grows down  <---------- | top
/// ```
pub struct Stack {
    base: *mut u8,
    len: usize,
    guard: usize,
}

impl Stack {
    /// Map at least `usable` bytes plus a guard page
    pub fn new(usable: usize) -> Result<Self, MemoryError> {
        let page = page_size();
        let guard = GUARD_SIZE.max(page);
        let usable = usable
            .checked_add(page - 1)
            .map(|n| n & !(page - 1))
            .ok_or(MemoryError::SizeOverflow)?;
        let len = usable.checked_add(guard).ok_or(MemoryError::SizeOverflow)?;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed(Errno::last_raw()));
        }

        // Guard page at the low end stays inaccessible.
        let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
        if let Err(errno) = Errno::result(ret) {
            unsafe { libc::munmap(base, len) };
            return Err(MemoryError::ProtectFailed(errno as i32));
        }

        note_mapped();
        Ok(Stack { base: base as *mut u8, len, guard })
    }

    /// High end of the stack (exclusive)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    /// Lowest usable address
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.guard) }
    }

    /// Usable bytes (excluding the guard)
    #[inline]
    pub fn usable(&self) -> usize {
        self.len - self.guard
    }

    /// True if `size` would map to the same usable length
    #[inline]
    pub fn fits(&self, size: usize) -> bool {
        let page = page_size();
        size.checked_add(page - 1).map(|n| n & !(page - 1)) == Some(self.usable())
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
        note_unmapped();
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stack({:p}..{:p})", self.bottom(), self.top())
    }
}
