// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! A double-ended queue over a power-of-two ring buffer.
//!
//! Voice pools push and pop at both ends and occasionally remove from the
//! middle, and they must not allocate at steady state. A mask-indexed ring
//! with geometric growth gives O(1) amortized push/pop at either end and
//! O(n/2) worst-case removal, with no allocation once the pool has warmed
//! up.

/// A growable ring-buffer deque with O(1) indexed access.
#[derive(Debug)]
pub struct Deque<T> {
    buffer: Vec<Option<T>>,
    mask: usize,
    offset: usize,
    count: usize,
}
impl<T> Default for Deque<T> {
    fn default() -> Self {
        Self::with_capacity(1)
    }
}
impl<T> Deque<T> {
    /// Creates a deque whose initial capacity is at least `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, || None);
        Self {
            buffer,
            mask: capacity - 1,
            offset: 0,
            count: 0,
        }
    }

    /// The number of elements currently stored.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the deque is empty.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds an element at the front.
    pub fn push_front(&mut self, element: T) {
        if self.count == self.buffer.len() {
            self.grow();
        }
        self.offset = self.offset.wrapping_sub(1) & self.mask;
        self.buffer[self.offset] = Some(element);
        self.count += 1;
    }

    /// Adds an element at the back.
    pub fn push_back(&mut self, element: T) {
        if self.count == self.buffer.len() {
            self.grow();
        }
        self.buffer[(self.offset + self.count) & self.mask] = Some(element);
        self.count += 1;
    }

    /// Removes and returns the front element, if any.
    pub fn pop_front(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let element = self.buffer[self.offset].take();
        self.offset = (self.offset + 1) & self.mask;
        self.count -= 1;
        element
    }

    /// Removes and returns the back element, if any.
    pub fn pop_back(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        self.buffer[(self.offset + self.count) & self.mask].take()
    }

    /// A reference to the front element.
    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    /// A reference to the back element.
    pub fn back(&self) -> Option<&T> {
        if self.count == 0 {
            None
        } else {
            self.get(self.count - 1)
        }
    }

    /// A reference to the element at `index` (0 = front).
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.count {
            None
        } else {
            self.buffer[(self.offset + index) & self.mask].as_ref()
        }
    }

    /// A mutable reference to the element at `index` (0 = front).
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.count {
            None
        } else {
            self.buffer[(self.offset + index) & self.mask].as_mut()
        }
    }

    /// Removes and returns the element at `index`, shifting the shorter side
    /// of the deque to fill the gap.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.count {
            return None;
        }
        let removed = self.buffer[(self.offset + index) & self.mask].take();
        if index <= self.count / 2 {
            let mut i = index;
            while i > 0 {
                let from = (self.offset + i - 1) & self.mask;
                let to = (self.offset + i) & self.mask;
                self.buffer[to] = self.buffer[from].take();
                i -= 1;
            }
            self.offset = (self.offset + 1) & self.mask;
        } else {
            let mut i = index;
            while i + 1 < self.count {
                let from = (self.offset + i + 1) & self.mask;
                let to = (self.offset + i) & self.mask;
                self.buffer[to] = self.buffer[from].take();
                i += 1;
            }
        }
        self.count -= 1;
        removed
    }

    /// Iterates front to back.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.count).filter_map(move |i| self.get(i))
    }

    fn grow(&mut self) {
        let old_capacity = self.buffer.len();
        let new_capacity = old_capacity * 2;
        let mut new_buffer: Vec<Option<T>> = Vec::with_capacity(new_capacity);
        new_buffer.resize_with(new_capacity, || None);
        for i in 0..self.count {
            new_buffer[i] = self.buffer[(self.offset + i) & self.mask].take();
        }
        self.buffer = new_buffer;
        self.mask = new_capacity - 1;
        self.offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::assert_ge;

    #[test]
    fn push_pop_both_ends() {
        let mut d = Deque::default();
        d.push_back(1);
        d.push_back(2);
        d.push_front(0);
        assert_eq!(d.len(), 3);
        assert_eq!(d.front(), Some(&0));
        assert_eq!(d.back(), Some(&2));
        assert_eq!(d.pop_front(), Some(0));
        assert_eq!(d.pop_back(), Some(2));
        assert_eq!(d.pop_back(), Some(1));
        assert_eq!(d.pop_back(), None);
    }

    #[test]
    fn wraparound_preserves_order() {
        let mut d = Deque::with_capacity(4);
        for i in 0..4 {
            d.push_back(i);
        }
        // Rotate a few times so the live region straddles the buffer seam.
        for i in 4..32 {
            assert_eq!(d.pop_front(), Some(i - 4));
            d.push_back(i);
        }
        let contents: Vec<i32> = d.iter().copied().collect();
        assert_eq!(contents, vec![28, 29, 30, 31]);
    }

    #[test]
    fn growth_keeps_contents() {
        let mut d = Deque::with_capacity(2);
        for i in 0..100 {
            d.push_back(i);
        }
        assert_eq!(d.len(), 100);
        assert_ge!(d.buffer.len(), 100);
        for i in 0..100 {
            assert_eq!(d.get(i), Some(&i));
        }
    }

    #[test]
    fn remove_from_middle() {
        let mut d = Deque::default();
        for i in 0..5 {
            d.push_back(i);
        }
        assert_eq!(d.remove(2), Some(2));
        let contents: Vec<i32> = d.iter().copied().collect();
        assert_eq!(contents, vec![0, 1, 3, 4]);
        assert_eq!(d.remove(3), Some(4));
        assert_eq!(d.remove(0), Some(0));
        let contents: Vec<i32> = d.iter().copied().collect();
        assert_eq!(contents, vec![1, 3]);
        assert_eq!(d.remove(5), None);
    }
}
