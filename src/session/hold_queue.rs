//! Bounded FIFO for items waiting on the connection

use std::collections::VecDeque;

/// Items held while the connection is down
///
/// When full, pushing drops the oldest item.
#[derive(Debug, Clone)]
pub struct HoldQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> HoldQueue<T> {
    /// Create a queue holding at most `capacity` items
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, returning the oldest one if it had to be dropped
    pub fn push(&mut self, item: T) -> Option<T> {
        let dropped = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        dropped
    }

    /// Oldest item
    #[must_use]
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Remove the oldest item
    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Items held
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of items
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
