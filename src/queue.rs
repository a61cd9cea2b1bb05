//! Ready queue — ordered thread ids awaiting execution
//!
//! The queue orders ids; it never owns control blocks. An id appears at
//! most once. Two insertion disciplines:
//! - `enqueue`: FIFO append
//! - `enqueue_sort`: linear insertion under a "ranks at or before"
//!   comparator. A tie with the head goes in front of it; ties further
//!   down keep arrival order.
//!
//! Author: Moroya Sakamoto

use std::collections::VecDeque;

use crate::tcb::ThreadId;

/// Ready queue
#[derive(Debug, Clone)]
pub struct ReadyQueue<T = ThreadId> {
    items: VecDeque<T>,
}

impl<T: Copy + PartialEq> ReadyQueue<T> {
    /// Create a new empty queue
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Append at the tail.
    ///
    /// Returns false if the item is already queued.
    pub fn enqueue(&mut self, item: T) -> bool {
        if self.contains(item) {
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Remove and return the head
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Head without removing it
    pub fn peek(&self) -> Option<T> {
        self.items.front().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn contains(&self, item: T) -> bool {
        self.items.contains(&item)
    }

    /// Queued items, head first
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.items.iter().copied()
    }

    /// Insert in ascending order under `comp`, where `comp(a, b)` means
    /// "a ranks at or before b".
    ///
    /// If the queue was sorted before the call it is sorted after it.
    /// Returns false if the item is already queued.
    pub fn enqueue_sort<F>(&mut self, item: T, mut comp: F) -> bool
    where
        F: FnMut(&T, &T) -> bool,
    {
        if self.contains(item) {
            return false;
        }
        let pos = match self.items.front() {
            None => 0,
            Some(head) if comp(&item, head) => 0,
            Some(_) => {
                let mut pos = 1;
                while pos < self.items.len() && comp(&self.items[pos], &item) {
                    pos += 1;
                }
                pos
            }
        };
        self.items.insert(pos, item);
        true
    }
}

impl<T: Copy + PartialEq> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le(a: &(u32, char), b: &(u32, char)) -> bool {
        a.0 <= b.0
    }

    fn keys(q: &ReadyQueue<(u32, char)>) -> Vec<char> {
        q.iter().map(|(_, tag)| tag).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut q = ReadyQueue::new();
        for i in 0..5 {
            assert!(q.enqueue(ThreadId(i)));
        }
        for i in 0..5 {
            assert_eq!(q.dequeue(), Some(ThreadId(i)));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_empty_queue() {
        let mut q: ReadyQueue = ReadyQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.peek(), None);
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let mut q = ReadyQueue::new();
        q.enqueue(ThreadId(7));
        q.enqueue(ThreadId(8));
        assert_eq!(q.peek(), Some(ThreadId(7)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(), Some(ThreadId(7)));
    }

    #[test]
    fn test_rejects_duplicates() {
        let mut q = ReadyQueue::new();
        assert!(q.enqueue(ThreadId(1)));
        assert!(!q.enqueue(ThreadId(1)));
        assert!(!q.enqueue_sort(ThreadId(1), |a, b| a <= b));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_sorted_insert() {
        let mut q = ReadyQueue::new();
        for (key, tag) in [(5, 'a'), (1, 'b'), (3, 'c'), (9, 'd'), (0, 'e')] {
            q.enqueue_sort((key, tag), le);
        }
        assert_eq!(keys(&q), vec!['e', 'b', 'c', 'a', 'd']);
    }

    #[test]
    fn test_ties_keep_arrival_order_after_head() {
        let mut q = ReadyQueue::new();
        q.enqueue_sort((0, 'x'), le);
        q.enqueue_sort((1, 'a'), le);
        q.enqueue_sort((1, 'b'), le);
        q.enqueue_sort((1, 'c'), le);
        assert_eq!(keys(&q), vec!['x', 'a', 'b', 'c']);
    }

    #[test]
    fn test_tie_with_head_goes_first() {
        let mut q = ReadyQueue::new();
        q.enqueue_sort((1, 'a'), le);
        q.enqueue_sort((1, 'b'), le);
        assert_eq!(keys(&q), vec!['b', 'a']);
        q.enqueue_sort((1, 'c'), le);
        assert_eq!(keys(&q), vec!['c', 'b', 'a']);
    }

    #[test]
    fn test_sorted_invariant_holds() {
        let mut q = ReadyQueue::new();
        // Deterministic pseudo-random keys
        let mut seed = 0x2545_f491_u32;
        for i in 0..200u32 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            q.enqueue_sort((seed % 17, i), |a: &(u32, u32), b: &(u32, u32)| a.0 <= b.0);
        }
        let seen: Vec<u32> = q.iter().map(|(k, _)| k).collect();
        assert_eq!(seen.len(), 200);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_sorted_insert_at_tail() {
        let mut q = ReadyQueue::new();
        q.enqueue_sort((1, 'a'), le);
        q.enqueue_sort((2, 'b'), le);
        q.enqueue_sort((3, 'c'), le);
        assert_eq!(keys(&q), vec!['a', 'b', 'c']);
        assert_eq!(q.peek(), Some((1, 'a')));
    }
}
