//! Fixed-capacity history ring
//!
//! Backs the connection-attempt history and the recent control errors.
//! Storage is allocated once; after it fills, each push overwrites the
//! oldest slot and advances the cursor.

/// Fixed-capacity ring that evicts its oldest entry on overflow
#[derive(Debug, Clone)]
pub struct BoundedRing<T> {
    slots: Vec<T>,
    capacity: usize,
    /// Index of the oldest entry once the ring is full
    cursor: usize,
}

impl<T> BoundedRing<T> {
    /// Create a ring holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    /// Append an entry, returning the evicted one if the ring was full
    pub fn push(&mut self, value: T) -> Option<T> {
        if self.slots.len() < self.capacity {
            self.slots.push(value);
            return None;
        }

        let evicted = std::mem::replace(&mut self.slots[self.cursor], value);
        self.cursor = (self.cursor + 1) % self.capacity;
        Some(evicted)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let (newer, older) = self.slots.split_at(self.cursor);
        older.iter().chain(newer.iter())
    }
}

impl<T: Clone> BoundedRing<T> {
    /// The newest `n` entries, oldest first
    pub fn last_n(&self, n: usize) -> Vec<T> {
        let skip = self.len().saturating_sub(n);
        self.iter().skip(skip).cloned().collect()
    }

    /// Copy out every entry, oldest first
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
