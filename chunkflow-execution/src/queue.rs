//! Priority admission queue

use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry<T> {
    priority: u32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap; reverse so the lowest (priority, seq) pops first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

/// Tasks waiting for a context, ordered by priority then arrival
pub struct AdmissionQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

impl<T> Default for AdmissionQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

impl<T> AdmissionQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next arrival sequence number
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Admit a new item behind everything of equal priority
    pub fn push(&mut self, priority: u32, item: T) -> u64 {
        let seq = self.next_seq();
        self.push_at(priority, seq, item);
        seq
    }

    /// Put an item back at a position it already held
    pub fn push_at(&mut self, priority: u32, seq: u64, item: T) {
        self.heap.push(Entry {
            priority,
            seq,
            item,
        });
    }

    pub fn pop(&mut self) -> Option<(u64, T)> {
        self.heap.pop().map(|entry| (entry.seq, entry.item))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove everything in dispatch order
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.heap.len());
        while let Some((_, item)) = self.pop() {
            items.push(item);
        }
        items
    }
}
