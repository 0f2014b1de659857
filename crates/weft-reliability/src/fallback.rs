//! Ordered fallback candidate chains.

use std::collections::HashSet;
use std::hash::Hash;

/// Ordered, de-duplicated candidate list with advance-to-next semantics.
///
/// Pure state machine; no I/O.
pub struct FallbackChain<T> {
    candidates: Vec<T>,
    position: usize,
}

impl<T> FallbackChain<T> {
    /// Build from a primary candidate plus fallbacks, dropping duplicates
    /// while preserving first-seen order.
    pub fn new(primary: T, fallbacks: Vec<T>) -> Self
    where
        T: PartialEq,
    {
        let mut candidates = vec![primary];
        for candidate in fallbacks {
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        Self {
            candidates,
            position: 0,
        }
    }

    /// Build from an ordered candidate list, de-duplicating by a derived key.
    pub fn with_key<K, F>(candidates: Vec<T>, key: F) -> Self
    where
        K: Eq + Hash,
        F: Fn(&T) -> K,
    {
        let mut seen = HashSet::new();
        let candidates = candidates
            .into_iter()
            .filter(|c| seen.insert(key(c)))
            .collect();
        Self {
            candidates,
            position: 0,
        }
    }

    /// Candidate currently being tried.
    pub fn current(&self) -> Option<&T> {
        self.candidates.get(self.position)
    }

    /// Move to the next candidate; `None` once past the end.
    pub fn advance(&mut self) -> Option<&T> {
        self.position += 1;
        self.current()
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.candidates.len()
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Total number of distinct candidates.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Whether fallbacks beyond the primary exist.
    pub fn has_fallbacks(&self) -> bool {
        self.candidates.len() > 1
    }
}
