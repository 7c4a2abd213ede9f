//! Bounded ring buffers with power-of-two capacity.
//!
//! `RingIndex` keeps free-running put/get counters and masks them on access,
//! so fullness and emptiness are distinguished without a spare slot. `Ring`
//! pairs an index with owned storage and backs every MAC queue: per-neighbor
//! packet queues, the incoming-frame buffer, the dequeued-packet buffer and
//! the log buffer.

use alloc::vec::Vec;

/// Put/get counters over a power-of-two ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndex {
    mask: u16,
    put: u16,
    get: u16,
}

impl RingIndex {
    /// Create an index over `capacity` slots.
    ///
    /// `capacity` is rounded up to the next power of two (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, 1 << 15).next_power_of_two();
        Self {
            mask: (capacity - 1) as u16,
            put: 0,
            get: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.put.wrapping_sub(self.get) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.put == self.get
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Slot the next put will write, if there is room.
    pub fn peek_put(&self) -> Option<usize> {
        if self.is_full() {
            None
        } else {
            Some((self.put & self.mask) as usize)
        }
    }

    /// Commit a put.
    pub fn put(&mut self) -> Option<usize> {
        let slot = self.peek_put()?;
        self.put = self.put.wrapping_add(1);
        Some(slot)
    }

    /// Slot the next get will read, if any.
    pub fn peek_get(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some((self.get & self.mask) as usize)
        }
    }

    /// Commit a get.
    pub fn get(&mut self) -> Option<usize> {
        let slot = self.peek_get()?;
        self.get = self.get.wrapping_add(1);
        Some(slot)
    }

    /// Slot of the `n`-th oldest element.
    pub fn nth(&self, n: usize) -> Option<usize> {
        if n >= self.len() {
            None
        } else {
            Some((self.get.wrapping_add(n as u16) & self.mask) as usize)
        }
    }
}

/// Bounded FIFO over a `RingIndex`.
pub struct Ring<T> {
    index: RingIndex,
    slots: Vec<Option<T>>,
}

impl<T> Ring<T> {
    /// Create a ring holding up to `capacity` elements (rounded to a power of two).
    pub fn with_capacity(capacity: usize) -> Self {
        let index = RingIndex::new(capacity);
        let mut slots = Vec::with_capacity(index.capacity());
        slots.resize_with(index.capacity(), || None);
        Self { index, slots }
    }

    /// Append to the back. Returns the value back when full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        match self.index.put() {
            Some(slot) => {
                self.slots[slot] = Some(value);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Remove from the front.
    pub fn pop(&mut self) -> Option<T> {
        let slot = self.index.get()?;
        self.slots[slot].take()
    }

    /// Oldest element.
    pub fn peek(&self) -> Option<&T> {
        self.index.peek_get().and_then(|slot| self.slots[slot].as_ref())
    }

    /// Oldest element, mutably.
    pub fn peek_mut(&mut self) -> Option<&mut T> {
        let slot = self.index.peek_get()?;
        self.slots[slot].as_mut()
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.index.len())
            .filter_map(move |n| self.index.nth(n))
            .filter_map(move |slot| self.slots[slot].as_ref())
    }

    /// Apply `f` to each element from oldest to newest.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut T)) {
        for n in 0..self.index.len() {
            if let Some(slot) = self.index.nth(n) {
                if let Some(value) = self.slots[slot].as_mut() {
                    f(value);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.index.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.index.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_index_rounds_capacity() {
        assert_eq!(RingIndex::new(5).capacity(), 8);
        assert_eq!(RingIndex::new(8).capacity(), 8);
        assert_eq!(RingIndex::new(0).capacity(), 1);
    }

    #[test]
    fn test_ring_index_full_and_empty() {
        let mut idx = RingIndex::new(4);
        assert!(idx.is_empty());
        for expected in 0..4 {
            assert_eq!(idx.put(), Some(expected));
        }
        assert!(idx.is_full());
        assert_eq!(idx.put(), None);
        assert_eq!(idx.get(), Some(0));
        assert_eq!(idx.put(), Some(0));
        assert_eq!(idx.len(), 4);
    }

    #[test]
    fn test_ring_index_counters_wrap() {
        let mut idx = RingIndex::new(2);
        for _ in 0..70_000u32 {
            assert!(idx.put().is_some());
            assert!(idx.get().is_some());
        }
        assert!(idx.is_empty());
        assert_eq!(idx.put(), Some((70_000 % 2) as usize));
    }

    #[test]
    fn test_ring_fifo_order() {
        let mut ring = Ring::with_capacity(4);
        for i in 0..4 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.push(99), Err(99));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), [0, 1, 2, 3]);
        assert_eq!(ring.pop(), Some(0));
        ring.push(4).unwrap();
        assert_eq!(ring.peek(), Some(&1));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_ring_for_each_mut() {
        let mut ring = Ring::with_capacity(4);
        ring.push(1).unwrap();
        ring.push(2).unwrap();
        ring.for_each_mut(|v| *v *= 10);
        assert_eq!(ring.pop(), Some(10));
        assert_eq!(ring.pop(), Some(20));
        assert_eq!(ring.pop(), None);
    }
}
