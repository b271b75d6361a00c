use std::collections::VecDeque;

/// CapacityExceeded is returned by a push against a full queue or shard.
/// Call sites map it to the site-specific [`crate::Error`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("the max capacity has been reached")]
pub struct CapacityExceeded;

/// BoundedQueue is a growable FIFO with a soft and a hard capacity bound,
/// used for the scheduler's intake and for the dispatch queue.
///
/// The queue itself is plain data: callers guard it with their own mutex.
/// Growth on push adds half of the remaining headroom; capacity is released
/// again once the length drains back to the default.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    cap: usize,
    default_cap: usize,
    max_cap: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(cap: usize, max_cap: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(cap),
            cap,
            default_cap: cap,
            max_cap,
        }
    }

    pub fn push(&mut self, item: T) -> Result<(), CapacityExceeded> {
        if self.items.len() == self.max_cap {
            return Err(CapacityExceeded);
        }
        if self.items.len() == self.cap && self.cap < self.max_cap {
            self.cap += (self.max_cap - self.cap).div_ceil(2);
            self.items.reserve(self.cap - self.items.len());
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        if self.items.len() == self.default_cap && self.cap != self.default_cap {
            self.cap = self.default_cap;
            self.items.shrink_to(self.default_cap);
        }
        Some(item)
    }

    pub fn get(&self, i: usize) -> Option<&T> {
        self.items.get(i)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Re-bound the queue in place. The current capacity is clamped into the
    /// new bounds; queued items are never dropped.
    pub fn set_capacity(&mut self, default_cap: usize, max_cap: usize) {
        self.default_cap = default_cap;
        self.max_cap = max_cap;
        self.cap = self.cap.clamp(default_cap, max_cap.max(default_cap));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_grows_by_half_of_headroom() {
        let mut queue = BoundedQueue::new(4, 10);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.capacity(), 4);

        // 5th push grows to 4 + ceil((10-4)/2) = 7, then to 7 + ceil(3/2) = 9, then 10.
        queue.push(4).unwrap();
        assert_eq!(queue.capacity(), 7);
        for i in 5..7 {
            queue.push(i).unwrap();
        }
        queue.push(7).unwrap();
        assert_eq!(queue.capacity(), 9);
    }

    #[test]
    fn push_at_max_capacity_fails_until_a_pop() {
        let mut queue = BoundedQueue::new(2, 4);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.push(4), Err(CapacityExceeded));

        assert_eq!(queue.pop(), Some(0));
        queue.push(4).unwrap();
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn pop_is_fifo_and_shrinks_back_to_default() {
        let mut queue = BoundedQueue::new(2, 8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        assert!(queue.capacity() > 2);

        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        // Length is back at the default capacity: release the headroom.
        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.get(0), Some(&3));
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let mut queue = BoundedQueue::<i32>::new(2, 4);
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }
}
