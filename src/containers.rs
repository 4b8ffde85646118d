//! Generally useful container data structures

use std::collections::VecDeque;

use unordered::UnorderedSet;

/// A first-in-first-out worklist which holds any pending item at most once. Re-adding an item
/// that is still queued leaves its original position untouched.
pub struct Worklist<T: Eq + std::hash::Hash + Ord + Clone> {
    queue: VecDeque<T>,
    pending: UnorderedSet<T>,
}

impl<T: Eq + std::hash::Hash + Ord + Clone> Worklist<T> {
    /// A new, empty worklist
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            pending: Default::default(),
        }
    }

    /// Queue `v` unless it is already pending. Returns whether it was queued.
    pub fn push(&mut self, v: T) -> bool {
        if self.pending.insert(v.clone()) {
            self.queue.push_back(v);
            true
        } else {
            false
        }
    }

    /// Take the oldest pending item
    pub fn pop(&mut self) -> Option<T> {
        let v = self.queue.pop_front()?;
        self.pending.remove(&v);
        Some(v)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Eq + std::hash::Hash + Ord + Clone> Default for Worklist<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + std::hash::Hash + Ord + Clone> FromIterator<T> for Worklist<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut w = Self::new();
        for v in iter {
            w.push(v);
        }
        w
    }
}

/// Unordered containers. These types specify the _intention_ of unorderedness, but allow the
/// crate's features to dictate whether they actually use non-determinism at runtime.
pub mod unordered {
    #[cfg(not(feature = "deterministic_containers"))]
    pub type UnorderedSet<T> = std::collections::HashSet<T>;
    #[cfg(feature = "deterministic_containers")]
    pub type UnorderedSet<T> = std::collections::BTreeSet<T>;
}
