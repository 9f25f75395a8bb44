// pulsegate/src/state/ring.rs
//
// Bounded FIFO over VecDeque. Push is O(1); once full, every push evicts
// the oldest element and hands it back to the caller.

use std::collections::VecDeque;

use serde::{Serialize, Serializer};

#[derive(Debug, Clone)]
pub struct Ring<T> {
    buf: VecDeque<T>,
    cap: usize,
}

impl<T> Ring<T> {
    /// `cap` is clamped to at least 1.
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { buf: VecDeque::with_capacity(cap.min(1024)), cap }
    }

    /// Append, returning the evicted oldest element when at capacity.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.buf.len() >= self.cap { self.buf.pop_front() } else { None };
        self.buf.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize { self.buf.len() }
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }
    pub fn clear(&mut self) { self.buf.clear(); }

    pub fn oldest(&self) -> Option<&T> { self.buf.front() }
    pub fn newest(&self) -> Option<&T> { self.buf.back() }
}

impl<T: Clone> Ring<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.buf.iter().cloned().collect()
    }
}

impl<T: Serialize> Serialize for Ring<T> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(self.buf.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut r = Ring::new(3);
        assert_eq!(r.push(1), None);
        assert_eq!(r.push(2), None);
        assert_eq!(r.push(3), None);
        assert_eq!(r.push(4), Some(1));
        assert_eq!(r.push(5), Some(2));
        assert_eq!(r.to_vec(), vec![3, 4, 5]);
        assert_eq!(r.oldest(), Some(&3));
        assert_eq!(r.newest(), Some(&5));
    }

    #[test]
    fn zero_capacity_clamps_to_one() {
        let mut r = Ring::new(0);
        r.push("a");
        assert_eq!(r.push("b"), Some("a"));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn serializes_as_sequence() {
        let mut r = Ring::new(2);
        r.push(1.5);
        r.push(2.5);
        r.push(3.5);
        assert_eq!(serde_json::to_string(&r).unwrap(), "[2.5,3.5]");
    }
}
