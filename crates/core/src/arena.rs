//! Per-operation visit arena
//!
//! Detach and attach walk object graphs that may contain cycles and shared
//! sub-graphs. A [`VisitArena`] gives every original instance reached during
//! one operation a stable index in encounter order and remembers the
//! counterpart produced for it, so each original is processed exactly once
//! and post-processing passes run in a deterministic order.

use crate::types::Oref;
use rustc_hash::FxHashMap;

/// Encounter-ordered map from original instance to produced counterpart
#[derive(Debug, Default)]
pub struct VisitArena {
    index: FxHashMap<Oref, usize>,
    entries: Vec<(Oref, Option<Oref>)>,
}

impl VisitArena {
    /// Empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `original`, returning its index; idempotent
    pub fn visit(&mut self, original: Oref) -> usize {
        if let Some(idx) = self.index.get(&original) {
            return *idx;
        }
        let idx = self.entries.len();
        self.entries.push((original, None));
        self.index.insert(original, idx);
        idx
    }

    /// Whether `original` was already reached
    pub fn contains(&self, original: Oref) -> bool {
        self.index.contains_key(&original)
    }

    /// Record the counterpart produced for `original`
    pub fn record(&mut self, original: Oref, produced: Oref) -> usize {
        let idx = self.visit(original);
        self.entries[idx].1 = Some(produced);
        idx
    }

    /// Counterpart produced for `original`, if any
    pub fn produced(&self, original: Oref) -> Option<Oref> {
        self.index
            .get(&original)
            .and_then(|idx| self.entries[*idx].1)
    }

    /// Whether `oref` is a counterpart produced during this operation
    pub fn is_produced(&self, oref: Oref) -> bool {
        self.entries.iter().any(|(_, p)| *p == Some(oref))
    }

    /// `(original, counterpart)` pairs in encounter order
    pub fn pairs(&self) -> impl Iterator<Item = (Oref, Oref)> + '_ {
        self.entries
            .iter()
            .filter_map(|(orig, produced)| produced.map(|p| (*orig, p)))
    }

    /// Number of originals reached
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was reached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every original reached at or after index `mark`, returning
    /// the counterparts produced for them
    pub fn truncate(&mut self, mark: usize) -> Vec<Oref> {
        if mark >= self.entries.len() {
            return Vec::new();
        }
        let dropped = self.entries.split_off(mark);
        dropped
            .into_iter()
            .filter_map(|(orig, produced)| {
                self.index.remove(&orig);
                produced
            })
            .collect()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
    }
}
