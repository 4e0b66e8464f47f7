//! Version vectors — per-participant counters for causal ordering.
//!
//! Each document tracks the highest operation sequence it has
//! incorporated from every participant. Two vectors compare pointwise:
//! one dominates the other (happened before/after), they are identical,
//! or each has seen something the other has not (concurrent).
//!
//! Entries only ever grow. The vector travels inside sync replies so a
//! reconnecting participant can tell exactly what it missed.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Pointwise relation between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// Identical histories.
    Equal,
    /// `self` has incorporated strictly less than `other`.
    Before,
    /// `self` has incorporated strictly more than `other`.
    After,
    /// Each side has operations the other has not seen.
    Concurrent,
}

/// Highest operation sequence incorporated per participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    counters: HashMap<Uuid, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence incorporated for `author` (zero when unseen).
    pub fn get(&self, author: Uuid) -> u64 {
        self.counters.get(&author).copied().unwrap_or(0)
    }

    /// Increment `author`'s own counter and return the new sequence.
    ///
    /// Called once per accepted operation by that author.
    pub fn advance(&mut self, author: Uuid) -> u64 {
        let entry = self.counters.entry(author).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Fold in a remotely observed sequence. Entries never decrease.
    pub fn observe(&mut self, author: Uuid, seq: u64) {
        let entry = self.counters.entry(author).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Pointwise maximum of both vectors — dominates both inputs.
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.clone();
        for (author, seq) in &other.counters {
            merged.observe(*author, *seq);
        }
        merged
    }

    /// Compare pointwise across the union of both key sets.
    pub fn compare(&self, other: &VersionVector) -> CausalOrder {
        let mut ahead = false;
        let mut behind = false;

        for (author, seq) in &self.counters {
            match seq.cmp(&other.get(*author)) {
                std::cmp::Ordering::Greater => ahead = true,
                std::cmp::Ordering::Less => behind = true,
                std::cmp::Ordering::Equal => {}
            }
        }
        for (author, seq) in &other.counters {
            if self.get(*author) < *seq {
                behind = true;
            }
        }

        match (ahead, behind) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// Number of participants tracked.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Iterate `(author, sequence)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Uuid, u64)> + '_ {
        self.counters.iter().map(|(a, s)| (*a, *s))
    }
}

// ===================================================================
// Tests
// ===================================================================
