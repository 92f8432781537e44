//! Synthetic critical section used by the benchmark.

use std::time::{Duration, Instant};

/// Entries in the cache table every request touches.
pub const CACHE_TABLE_LEN: usize = 128;

/// Shared state guarded by the lock under test.
///
/// Besides the counter, each request walks a table spanning several cache
/// lines so that moving the critical section between cores has a visible
/// cost.
#[derive(Debug, Clone)]
pub struct Workload {
    pub counter: u64,
    pub cache_table: [u32; CACHE_TABLE_LEN],
}

impl Default for Workload {
    fn default() -> Self {
        Self::new()
    }
}

impl Workload {
    pub const fn new() -> Self {
        Self {
            counter: 0,
            cache_table: [0; CACHE_TABLE_LEN],
        }
    }

    /// One request: bump the counter, touch the table, then busy-wait
    /// `delay_us` microseconds while still inside the critical section.
    #[inline]
    pub fn increment(&mut self, delay_us: u64) -> u64 {
        self.counter += 1;
        for entry in self.cache_table.iter_mut() {
            *entry = entry.wrapping_add(1);
        }
        if delay_us > 0 {
            busy_delay(Duration::from_micros(delay_us));
        }
        self.counter
    }
}

/// Nodes each worker links and unlinks per list request round.
pub const LIST_LEN: usize = 10;

/// Pause between two list requests of the same worker.
pub const LIST_GAP: Duration = Duration::from_micros(5);

/// Doubly linked list shared by every worker of a list run.
///
/// Links are indices into flat arrays: slot 0 is the head sentinel and entry
/// `e` lives in slot `e + 1`. Worker `w` owns entries
/// `w * LIST_LEN..(w + 1) * LIST_LEN`, so two workers never link the same
/// entry. Adds push at the front like `list_add`; removals unlink wherever
/// the entry sits.
#[derive(Debug, Clone)]
pub struct ListWorkload {
    next: Vec<usize>,
    prev: Vec<usize>,
    linked: Vec<bool>,
    len: usize,
    /// Successful adds and removals.
    pub ops: u64,
    /// Adds of linked entries and removals of unlinked ones.
    pub misses: u64,
}

impl ListWorkload {
    /// An empty list with room for `entries` nodes.
    pub fn new(entries: usize) -> Self {
        Self {
            next: vec![0; entries + 1],
            prev: vec![0; entries + 1],
            linked: vec![false; entries + 1],
            len: 0,
            ops: 0,
            misses: 0,
        }
    }

    /// Room for the entries of `workers` workers.
    pub fn for_workers(workers: usize) -> Self {
        Self::new(workers * LIST_LEN)
    }

    pub fn capacity(&self) -> usize {
        self.next.len() - 1
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links `entry` right after the head.
    ///
    /// # Returns
    ///
    /// `false` when `entry` is out of range or already linked; the miss is
    /// counted and the list is left as it was.
    pub fn push_front(&mut self, entry: usize) -> bool {
        let slot = entry + 1;
        if slot >= self.next.len() || self.linked[slot] {
            self.misses += 1;
            return false;
        }
        let first = self.next[0];
        self.next[slot] = first;
        self.prev[slot] = 0;
        self.prev[first] = slot;
        self.next[0] = slot;
        self.linked[slot] = true;
        self.len += 1;
        self.ops += 1;
        true
    }

    /// Unlinks `entry`.
    ///
    /// # Returns
    ///
    /// `false` when `entry` is out of range or not linked; the miss is
    /// counted and the list is left as it was.
    pub fn remove(&mut self, entry: usize) -> bool {
        let slot = entry + 1;
        if slot >= self.next.len() || !self.linked[slot] {
            self.misses += 1;
            return false;
        }
        let (prev, next) = (self.prev[slot], self.next[slot]);
        self.next[prev] = next;
        self.prev[next] = prev;
        self.linked[slot] = false;
        self.len -= 1;
        self.ops += 1;
        true
    }

    /// Entries from the front, following the forward links.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut slot = self.next[0];
        std::iter::from_fn(move || {
            if slot == 0 {
                return None;
            }
            let entry = slot - 1;
            slot = self.next[slot];
            Some(entry)
        })
    }
}

/// Spins for `delay` without yielding, like a udelay.
pub fn busy_delay(delay: Duration) {
    let start = Instant::now();
    while start.elapsed() < delay {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_touches_counter_and_table() {
        let mut work = Workload::new();
        assert_eq!(work.increment(0), 1);
        assert_eq!(work.increment(0), 2);
        assert!(work.cache_table.iter().all(|&e| e == 2));
    }

    #[test]
    fn delay_is_spent_inside_the_call() {
        let mut work = Workload::new();
        let start = Instant::now();
        work.increment(200);
        assert!(start.elapsed() >= Duration::from_micros(200));
    }

    #[test]
    fn list_links_at_the_front_and_unlinks_anywhere() {
        let mut list = ListWorkload::new(4);
        for entry in 0..4 {
            assert!(list.push_front(entry));
        }
        assert_eq!(list.iter().collect::<Vec<_>>(), [3, 2, 1, 0]);

        assert!(list.remove(2));
        assert!(list.remove(0));
        assert_eq!(list.iter().collect::<Vec<_>>(), [3, 1]);
        assert_eq!(list.len(), 2);

        assert!(list.remove(3));
        assert!(list.remove(1));
        assert!(list.is_empty());
        assert_eq!(list.iter().count(), 0);
        assert_eq!((list.ops, list.misses), (8, 0));
    }

    #[test]
    fn list_counts_misses_without_corrupting_links() {
        let mut list = ListWorkload::for_workers(2);
        assert_eq!(list.capacity(), 2 * LIST_LEN);

        assert!(!list.remove(0));
        assert!(list.push_front(5));
        assert!(!list.push_front(5));
        assert!(!list.push_front(list.capacity()));
        assert_eq!(list.iter().collect::<Vec<_>>(), [5]);
        assert_eq!((list.ops, list.misses), (1, 3));
    }
}
