use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::types::block::Period;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEntry {
    pub validator: PublicKey,
    pub weight: u64,
}

/// Stake distribution effective from `period` onwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StakeSnapshot {
    pub period: Period,
    entries: Vec<StakeEntry>,
}

impl StakeSnapshot {
    /// Build a snapshot. Entries are sorted by validator and zero weights
    /// dropped; a repeated validator keeps its last weight.
    pub fn new(period: Period, entries: impl IntoIterator<Item = StakeEntry>) -> Self {
        let mut entries: Vec<StakeEntry> = entries.into_iter().filter(|e| e.weight > 0).collect();
        entries.reverse();
        entries.sort_by_key(|e| e.validator);
        entries.dedup_by_key(|e| e.validator);
        StakeSnapshot { period, entries }
    }

    pub fn total_weight(&self) -> u64 {
        self.entries.iter().map(|e| e.weight).sum()
    }

    pub fn weight_of(&self, validator: &PublicKey) -> u64 {
        self.entries
            .binary_search_by_key(validator, |e| e.validator)
            .map(|i| self.entries[i].weight)
            .unwrap_or(0)
    }

    pub fn entries(&self) -> &[StakeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
