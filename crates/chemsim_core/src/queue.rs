//! Event-ordering queues: pending delayed-reaction completions and the putative firing
//! times of the next-reaction method.

use std::cmp::Ordering;
use std::collections::VecDeque;

/// Common interface of the completion-time queues.
pub trait EventQueue<T> {
    fn add(&mut self, item: T);
    /// The item that `get_next` would return, without removing it.
    fn peek_next(&self) -> Option<&T>;
    fn get_next(&mut self) -> Option<T>;
    fn size(&self) -> usize;
    fn clear(&mut self);

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Array-backed binary min-heap ordered by a caller-supplied comparator.
///
/// The children of slot `i` live at `2i + 1` and `2i + 2`.
pub struct PriorityQueue<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    items: Vec<T>,
    compare: F,
}

impl<T, F> PriorityQueue<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    pub fn new(compare: F) -> Self {
        Self {
            items: Vec::new(),
            compare,
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.compare)(&self.items[a], &self.items[b]) == Ordering::Less
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.items.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.less(right, left) {
                smallest = right;
            }
            if !self.less(smallest, index) {
                break;
            }
            self.items.swap(index, smallest);
            index = smallest;
        }
    }
}

impl<T, F> EventQueue<T> for PriorityQueue<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn add(&mut self, item: T) {
        self.items.push(item);
        let last = self.items.len() - 1;
        self.sift_up(last);
    }

    fn peek_next(&self) -> Option<&T> {
        self.items.first()
    }

    fn get_next(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let next = self.items.swap_remove(0);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Some(next)
    }

    fn size(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

/// Binary min-heap over a fixed set of slots whose keys can change in place.
///
/// Slots are numbered in the order they are offered. `heap[p]` is the slot stored at
/// heap position `p` and `positions[slot]` is the inverse mapping.
pub struct IndexedPriorityQueue<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    keys: Vec<T>,
    heap: Vec<usize>,
    positions: Vec<usize>,
    compare: F,
}

impl<T, F> IndexedPriorityQueue<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    pub fn new(compare: F) -> Self {
        Self {
            keys: Vec::new(),
            heap: Vec::new(),
            positions: Vec::new(),
            compare,
        }
    }

    /// Adds a slot holding `key` and returns its index.
    pub fn offer(&mut self, key: T) -> usize {
        let slot = self.keys.len();
        self.keys.push(key);
        self.positions.push(self.heap.len());
        self.heap.push(slot);
        self.sift_up(self.heap.len() - 1);
        slot
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.keys.get(slot)
    }

    /// Replaces the key of `slot`. Returns false when no such slot exists.
    pub fn update(&mut self, slot: usize, key: T) -> bool {
        let Some(stored) = self.keys.get_mut(slot) else {
            return false;
        };
        *stored = key;
        self.sift_up(self.positions[slot]);
        self.sift_down(self.positions[slot]);
        true
    }

    /// Slot with the smallest key.
    pub fn peek_index(&self) -> Option<usize> {
        self.heap.first().copied()
    }

    pub fn size(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.heap.clear();
        self.positions.clear();
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.compare)(&self.keys[self.heap[a]], &self.keys[self.heap[b]]) == Ordering::Less
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.positions[self.heap[a]] = a;
        self.positions[self.heap[b]] = b;
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.less(right, left) {
                smallest = right;
            }
            if !self.less(smallest, index) {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }
}

/// First-in first-out queue.
#[derive(Debug, Clone, Default)]
pub struct FifoQueue<T> {
    items: VecDeque<T>,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> EventQueue<T> for FifoQueue<T> {
    fn add(&mut self, item: T) {
        self.items.push_back(item);
    }

    fn peek_next(&self) -> Option<&T> {
        self.items.front()
    }

    fn get_next(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    fn size(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn random_insertions_drain_sorted() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let mut queue = PriorityQueue::new(f64::total_cmp);
        for _ in 0..500 {
            queue.add(rng.gen_range(-100.0..100.0));
        }
        assert_eq!(queue.size(), 500);

        let mut previous = f64::NEG_INFINITY;
        while let Some(next) = queue.get_next() {
            assert!(next >= previous);
            previous = next;
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn size_tracks_interleaved_adds_and_gets() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut queue = PriorityQueue::new(|a: &u32, b: &u32| a.cmp(b));
        let mut mirror: Vec<u32> = Vec::new();
        let mut adds = 0;
        let mut gets = 0;

        for _ in 0..2000 {
            if rng.gen_bool(0.6) || mirror.is_empty() {
                let value = rng.gen_range(0..1000);
                queue.add(value);
                mirror.push(value);
                adds += 1;
            } else {
                let min = *mirror.iter().min().expect("non-empty");
                let position = mirror.iter().position(|v| *v == min).expect("present");
                mirror.swap_remove(position);
                assert_eq!(queue.peek_next(), Some(&min));
                assert_eq!(queue.get_next(), Some(min));
                gets += 1;
            }
            assert_eq!(queue.size(), adds - gets);
        }
    }

    #[test]
    fn comparator_controls_order() {
        let mut queue = PriorityQueue::new(|a: &i32, b: &i32| b.cmp(a));
        for v in [3, 9, 1, 7] {
            queue.add(v);
        }
        assert_eq!(queue.get_next(), Some(9));
        assert_eq!(queue.get_next(), Some(7));
        queue.clear();
        assert_eq!(queue.get_next(), None);
    }

    #[test]
    fn indexed_queue_tracks_minimum_through_updates() {
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        let mut queue = IndexedPriorityQueue::new(f64::total_cmp);
        let mut mirror = Vec::new();
        for slot in 0..64 {
            let key = rng.gen_range(0.0..10.0);
            assert_eq!(queue.offer(key), slot);
            mirror.push(key);
        }

        for _ in 0..1000 {
            let slot = rng.gen_range(0..mirror.len());
            let key = if rng.gen_bool(0.1) {
                f64::INFINITY
            } else {
                rng.gen_range(0.0..10.0)
            };
            assert!(queue.update(slot, key));
            mirror[slot] = key;

            let min = mirror.iter().copied().fold(f64::INFINITY, f64::min);
            let top = queue.peek_index().expect("non-empty");
            assert_eq!(mirror[top], min);
            assert_eq!(queue.get(top), Some(&min));
        }
        assert_eq!(queue.size(), 64);
        assert!(!queue.update(64, 1.0));

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.peek_index(), None);
    }

    #[test]
    fn fifo_preserves_insertion_order() {
        let mut queue = FifoQueue::new();
        queue.add(2.0);
        queue.add(1.0);
        assert_eq!(queue.peek_next(), Some(&2.0));
        assert_eq!(queue.get_next(), Some(2.0));
        assert_eq!(queue.get_next(), Some(1.0));
        assert_eq!(queue.get_next(), None);
    }
}
