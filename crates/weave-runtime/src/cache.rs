//! Per-context block cache
//!
//! Blocks come in eight power-of-two size classes, 64 bytes to 8 KiB.
//! The owner allocates and frees without synchronization. A block freed
//! on a foreign context goes onto the owner's lock-free remote queue and
//! is folded back into the free lists on the owner's next trim.
//! Requests above the largest class bypass the cache.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;

pub const MIN_CLASS: usize = 64;
pub const CLASSES: usize = 8;
pub const MAX_CLASS: usize = MIN_CLASS << (CLASSES - 1);

/// Size class for `size`, or `None` when it is too large to cache
#[inline]
pub fn class_of(size: usize) -> Option<usize> {
    if size > MAX_CLASS {
        return None;
    }
    let rounded = size.max(MIN_CLASS).next_power_of_two();
    Some((rounded.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize)
}

/// A block handed out by [`LocalCache::alloc`]
pub struct CacheBlock {
    buf: Box<[u8]>,
    len: usize,
    owner: u32,
}

impl CacheBlock {
    /// Context whose cache the block returns to
    #[inline]
    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Bytes actually reserved (the class size)
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Deref for CacheBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl DerefMut for CacheBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl fmt::Debug for CacheBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheBlock({} of {}, owner {})", self.len, self.buf.len(), self.owner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub remote_frees: u64,
    pub released: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    remote_frees: AtomicU64,
    released: AtomicU64,
}

pub struct LocalCache {
    owner: u32,
    /// Blocks kept per class
    limit: usize,
    classes: RefCell<[Vec<Box<[u8]>>; CLASSES]>,
    remote: SegQueue<Box<[u8]>>,
    counters: Counters,
}

impl LocalCache {
    pub fn new(owner: u32, limit: usize) -> Self {
        LocalCache {
            owner,
            limit,
            classes: RefCell::new(Default::default()),
            remote: SegQueue::new(),
            counters: Counters::default(),
        }
    }

    /// Owner only
    pub fn alloc(&self, size: usize) -> CacheBlock {
        let buf = match class_of(size) {
            Some(class) => match self.classes.borrow_mut()[class].pop() {
                Some(buf) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    buf
                }
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    vec![0u8; MIN_CLASS << class].into_boxed_slice()
                }
            },
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                vec![0u8; size].into_boxed_slice()
            }
        };
        CacheBlock { buf, len: size, owner: self.owner }
    }

    /// Owner only
    pub fn free_local(&self, block: CacheBlock) {
        debug_assert_eq!(block.owner, self.owner);
        self.keep(block.buf);
    }

    /// Any thread
    pub fn free_remote(&self, block: CacheBlock) {
        debug_assert_eq!(block.owner, self.owner);
        self.counters.remote_frees.fetch_add(1, Ordering::Relaxed);
        self.remote.push(block.buf);
    }

    fn keep(&self, buf: Box<[u8]>) {
        let class = match class_of(buf.len()) {
            Some(class) if buf.len() == MIN_CLASS << class => class,
            _ => return,
        };
        let mut classes = self.classes.borrow_mut();
        if classes[class].len() < self.limit {
            classes[class].push(buf);
        } else {
            self.counters.released.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fold remote frees back in; owner only. Returns blocks taken back.
    pub fn trim(&self) -> usize {
        let mut n = 0;
        while let Some(buf) = self.remote.pop() {
            self.keep(buf);
            n += 1;
        }
        n
    }

    /// Blocks cached for `class`
    pub fn cached(&self, class: usize) -> usize {
        self.classes.borrow()[class].len()
    }

    pub fn remote_pending(&self) -> usize {
        self.remote.len()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            remote_frees: c.remote_frees.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCache")
            .field("owner", &self.owner)
            .field("limit", &self.limit)
            .field("stats", &self.stats())
            .finish()
    }
}
