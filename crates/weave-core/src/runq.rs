//! Priority run queue
//!
//! One FIFO bucket per priority level plus a `u32` bitmap of non-empty
//! buckets. Bit `i` set means bucket `i` holds something; priority 0 is
//! the most urgent, so "highest ready" is the lowest set bit.

use std::collections::VecDeque;

use crate::constants::PRIORITY_LEVELS;
use crate::state::Priority;

const _: () = assert!(PRIORITY_LEVELS <= u32::BITS as usize);

/// Priority-bucketed ready list with O(1) highest-priority pop
pub struct RunQueue<T> {
    bitmap: u32,
    buckets: [VecDeque<T>; PRIORITY_LEVELS],
    len: usize,
}

impl<T> RunQueue<T> {
    pub fn new() -> Self {
        RunQueue {
            bitmap: 0,
            buckets: std::array::from_fn(|_| VecDeque::new()),
            len: 0,
        }
    }

    /// Append to the back of `priority`'s bucket
    #[inline]
    pub fn put(&mut self, priority: Priority, item: T) {
        let idx = priority.as_index();
        self.buckets[idx].push_back(item);
        self.bitmap |= 1 << idx;
        self.len += 1;
    }

    /// Pop the oldest entry of the highest non-empty priority
    #[inline]
    pub fn get(&mut self) -> Option<(Priority, T)> {
        let idx = self.top_index()?;
        let bucket = &mut self.buckets[idx];
        let item = bucket.pop_front()?;
        if bucket.is_empty() {
            self.bitmap &= !(1 << idx);
        }
        self.len -= 1;
        Some((Priority::new(idx as u8), item))
    }

    /// Highest priority present, without popping
    #[inline]
    pub fn top_priority(&self) -> Option<Priority> {
        self.top_index().map(|idx| Priority::new(idx as u8))
    }

    #[inline]
    fn top_index(&self) -> Option<usize> {
        match self.bitmap {
            0 => None,
            bits => Some(bits.trailing_zeros() as usize),
        }
    }

    /// Remove the first entry in `priority`'s bucket matching `pred`
    pub fn remove_where<F>(&mut self, priority: Priority, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let idx = priority.as_index();
        let bucket = &mut self.buckets[idx];
        let pos = bucket.iter().position(|item| pred(item))?;
        let item = bucket.remove(pos)?;
        if bucket.is_empty() {
            self.bitmap &= !(1 << idx);
        }
        self.len -= 1;
        Some(item)
    }

    /// Move a matching entry to another bucket (appended at the back)
    pub fn requeue<F>(&mut self, from: Priority, to: Priority, pred: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        match self.remove_where(from, pred) {
            Some(item) => {
                self.put(to, item);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    /// Bitmap of non-empty buckets
    #[inline]
    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }

    /// Drain everything in priority order
    pub fn drain(&mut self) -> impl Iterator<Item = (Priority, T)> + '_ {
        std::iter::from_fn(move || self.get())
    }
}

impl<T> Default for RunQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(level: u8) -> Priority {
        Priority::new(level)
    }

    #[test]
    fn test_priority_order_fifo_within_bucket() {
        let mut rq = RunQueue::new();
        rq.put(p(5), "a");
        rq.put(p(1), "b");
        rq.put(p(5), "c");
        rq.put(p(3), "d");
        assert_eq!(rq.len(), 4);

        let order: Vec<_> = rq.drain().collect();
        assert_eq!(order, vec![(p(1), "b"), (p(3), "d"), (p(5), "a"), (p(5), "c")]);
        assert!(rq.is_empty());
        assert_eq!(rq.bitmap(), 0);
    }

    #[test]
    fn test_bitmap_tracks_buckets() {
        let mut rq = RunQueue::new();
        rq.put(p(0), 1);
        rq.put(p(31), 2);
        assert_eq!(rq.bitmap(), 1 | (1 << 31));
        assert_eq!(rq.top_priority(), Some(p(0)));
        rq.get();
        assert_eq!(rq.bitmap(), 1 << 31);
        assert_eq!(rq.get(), Some((p(31), 2)));
        assert_eq!(rq.get(), None);
    }

    #[test]
    fn test_requeue_moves_to_back() {
        let mut rq = RunQueue::new();
        rq.put(p(8), 10);
        rq.put(p(2), 20);
        rq.put(p(2), 21);
        assert!(rq.requeue(p(8), p(2), |&x| x == 10));
        assert!(!rq.requeue(p(8), p(2), |&x| x == 10));
        let order: Vec<_> = rq.drain().map(|(_, v)| v).collect();
        assert_eq!(order, vec![20, 21, 10]);
    }

    #[test]
    fn test_remove_clears_bit() {
        let mut rq = RunQueue::new();
        rq.put(p(4), 'x');
        assert_eq!(rq.remove_where(p(4), |&c| c == 'x'), Some('x'));
        assert!(rq.is_empty());
        assert_eq!(rq.len(), 0);
    }
}
