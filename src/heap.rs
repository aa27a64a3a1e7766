//! Comparator-driven binary max-heap.
//!
//! Unlike [`std::collections::BinaryHeap`] the ordering is not baked into the
//! element type: every operation takes the comparator, so the same element
//! type can live in differently-ordered heaps. The player exploits this to
//! run a min-merge by handing in an inverted comparator.
//!
//! Backing store is a flat `Vec`, element `i` has children `2i+1` and `2i+2`.

use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct Heap<T> {
    slots: Vec<T>,
}

impl<T> Default for Heap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Heap<T> {
    pub fn new() -> Self {
        Heap { slots: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Heap {
            slots: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Largest element under the comparator the heap was maintained with.
    pub fn peek(&self) -> Option<&T> {
        self.slots.first()
    }

    /// O(log n). The comparator must be consistent with every previous call
    /// on this heap or the heap property is lost.
    pub fn insert<F>(&mut self, item: T, cmp: &F)
    where
        F: Fn(&T, &T) -> Ordering,
    {
        self.slots.push(item);
        self.sift_up(self.slots.len() - 1, cmp);
    }

    /// Removes and returns the maximum under `cmp`, or `None` when empty.
    pub fn pop_max<F>(&mut self, cmp: &F) -> Option<T>
    where
        F: Fn(&T, &T) -> Ordering,
    {
        if self.slots.is_empty() {
            return None;
        }
        let last = self.slots.len() - 1;
        self.slots.swap(0, last);
        let top = self.slots.pop();
        if !self.slots.is_empty() {
            self.sift_down(0, cmp);
        }
        top
    }

    fn sift_up<F>(&mut self, mut at: usize, cmp: &F)
    where
        F: Fn(&T, &T) -> Ordering,
    {
        while at > 0 {
            let parent = (at - 1) / 2;
            if cmp(&self.slots[at], &self.slots[parent]) != Ordering::Greater {
                break;
            }
            self.slots.swap(at, parent);
            at = parent;
        }
    }

    fn sift_down<F>(&mut self, mut at: usize, cmp: &F)
    where
        F: Fn(&T, &T) -> Ordering,
    {
        let len = self.slots.len();
        loop {
            let left = 2 * at + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut best = left;
            if right < len && cmp(&self.slots[right], &self.slots[left]) == Ordering::Greater {
                best = right;
            }
            if cmp(&self.slots[best], &self.slots[at]) != Ordering::Greater {
                break;
            }
            self.slots.swap(at, best);
            at = best;
        }
    }
}
