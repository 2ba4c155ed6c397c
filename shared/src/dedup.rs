//! Bounded set of already-dispatched message identifiers.

use std::collections::{HashSet, VecDeque};

/// Default number of identifiers tracked by an agent
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// Insertion-ordered ring of identifiers with a set index.
///
/// Holds at most `capacity` identifiers; inserting into a full cache evicts
/// the oldest one.
#[derive(Debug)]
pub struct SeenCache {
    order: VecDeque<String>,
    index: HashSet<String>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            index: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.index.contains(id) {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest);
            }
        }

        self.order.push_back(id.to_string());
        self.index.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}
