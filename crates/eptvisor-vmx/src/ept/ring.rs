use eptvisor_core::Va;

/// Fixed-capacity ring of instruction pointers that touched a watched page.
///
/// Once full, every push overwrites the oldest entry.
#[derive(Debug)]
pub struct AccessRing {
    entries: Vec<Va>,
    capacity: usize,
    head: usize,
}

impl AccessRing {
    /// Creates an empty ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    /// Records `rip`.
    pub fn push(&mut self, rip: Va) {
        if self.capacity == 0 {
            return;
        }

        if self.entries.len() < self.capacity {
            self.entries.push(rip);
        }
        else {
            self.entries[self.head] = rip;
        }

        self.head = (self.head + 1) % self.capacity;
    }

    /// Returns the recorded entries, oldest first.
    pub fn to_vec(&self) -> Vec<Va> {
        if self.entries.len() < self.capacity {
            return self.entries.clone();
        }

        let (newer, older) = self.entries.split_at(self.head);
        older.iter().chain(newer).copied().collect()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_until_full() {
        let mut ring = AccessRing::new(4);
        ring.push(Va(1));
        ring.push(Va(2));
        ring.push(Va(3));
        assert_eq!(ring.to_vec(), [Va(1), Va(2), Va(3)]);
    }

    #[test]
    fn overwrites_oldest() {
        let mut ring = AccessRing::new(3);
        for rip in 1..=5 {
            ring.push(Va(rip));
        }

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.to_vec(), [Va(3), Va(4), Va(5)]);
    }

    #[test]
    fn clear_resets() {
        let mut ring = AccessRing::new(2);
        ring.push(Va(1));
        ring.push(Va(2));
        ring.push(Va(3));
        ring.clear();
        assert!(ring.is_empty());

        ring.push(Va(4));
        assert_eq!(ring.to_vec(), [Va(4)]);
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let mut ring = AccessRing::new(0);
        ring.push(Va(1));
        assert!(ring.is_empty());
    }
}
