//! Free-index allocator for group membership slots.
//!
//! Always hands out the lowest free index, so a released index is the next
//! one reused.

use std::collections::BTreeSet;

/// Allocator over `[0, capacity)`.
#[derive(Debug, Clone)]
pub struct HandleMgr {
    capacity: u32,
    next: u32,
    released: BTreeSet<u32>,
}

impl HandleMgr {
    /// Create an allocator with every index free.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next: 0,
            released: BTreeSet::new(),
        }
    }

    /// Total number of indices.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of indices currently handed out.
    pub fn in_use(&self) -> usize {
        self.next as usize - self.released.len()
    }

    /// Take the lowest free index, or `None` if all are in use.
    pub fn acquire(&mut self) -> Option<u32> {
        if let Some(index) = self.released.pop_first() {
            return Some(index);
        }
        if self.next < self.capacity {
            self.next += 1;
            return Some(self.next - 1);
        }
        None
    }

    /// Return `index` to the free pool. Returns `false` if it was not
    /// allocated.
    pub fn release(&mut self, index: u32) -> bool {
        if index >= self.next {
            return false;
        }
        self.released.insert(index)
    }

    /// Whether `index` is currently allocated.
    pub fn is_allocated(&self, index: u32) -> bool {
        index < self.next && !self.released.contains(&index)
    }

    /// Free every index.
    pub fn clear(&mut self) {
        self.next = 0;
        self.released.clear();
    }
}
