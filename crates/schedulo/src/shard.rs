use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::event::EventRecord;
use crate::queue::CapacityExceeded;

/// Entry orders records by firing time, earliest first once wrapped in
/// [`Reverse`]. Records with equal firing times order by id; callers must
/// not rely on any particular tie-break.
#[derive(Debug, PartialEq, Eq)]
struct Entry(EventRecord);

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .should_execute_at
            .cmp(&other.0.should_execute_at)
            .then_with(|| self.0.id.cmp(&other.0.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Shard is one time-ordered pending structure: a min-heap keyed by
/// `should_execute_at`, with the same soft/hard capacity policy as
/// [`crate::BoundedQueue`].
#[derive(Debug)]
pub(crate) struct Shard {
    heap: BinaryHeap<Reverse<Entry>>,
    cap: usize,
    default_cap: usize,
    max_cap: usize,
}

impl Shard {
    pub fn new(cap: usize, max_cap: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(cap),
            cap,
            default_cap: cap,
            max_cap,
        }
    }

    pub fn push(&mut self, record: EventRecord) -> Result<(), CapacityExceeded> {
        if self.heap.len() == self.max_cap {
            return Err(CapacityExceeded);
        }
        if self.heap.len() == self.cap && self.cap < self.max_cap {
            self.cap += (self.max_cap - self.cap).div_ceil(2);
            self.heap.reserve(self.cap - self.heap.len());
        }
        self.heap.push(Reverse(Entry(record)));
        Ok(())
    }

    /// Remove and return the earliest-firing record.
    pub fn pop(&mut self) -> Option<EventRecord> {
        let Reverse(Entry(record)) = self.heap.pop()?;
        if self.heap.len() == self.default_cap && self.cap != self.default_cap {
            self.cap = self.default_cap;
            self.heap.shrink_to(self.default_cap);
        }
        Some(record)
    }

    pub fn peek(&self) -> Option<&EventRecord> {
        self.heap.peek().map(|Reverse(Entry(record))| record)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn max_capacity(&self) -> usize {
        self.max_cap
    }

    pub fn set_max_capacity(&mut self, max_cap: usize) {
        self.max_cap = max_cap;
    }

    /// Drain every record, unordered. Used when the bank splices a shard away.
    pub fn drain(&mut self) -> Vec<EventRecord> {
        self.heap.drain().map(|Reverse(Entry(record))| record).collect()
    }
}
