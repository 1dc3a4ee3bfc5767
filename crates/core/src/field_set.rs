//! Fixed-length field bitsets
//!
//! Every managed instance tracks its `loaded`, `dirty` and `flushed` fields
//! as a [`FieldSet`] sized to the class field count. Bits beyond the length
//! do not exist: reads past the end answer `false`, writes past the end are
//! a programming error.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

const WORD_BITS: usize = 64;

/// Bitset with one bit per persistent field
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSet {
    len: usize,
    words: SmallVec<[u64; 2]>,
}

impl FieldSet {
    /// Empty set for a class with `len` fields
    pub fn new(len: usize) -> Self {
        let words = (len + WORD_BITS - 1) / WORD_BITS;
        FieldSet {
            len,
            words: SmallVec::from_elem(0, words),
        }
    }

    /// Set with every field present
    pub fn full(len: usize) -> Self {
        let mut set = FieldSet::new(len);
        for i in 0..len {
            set.insert(i);
        }
        set
    }

    /// Set containing exactly `indices`
    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut set = FieldSet::new(len);
        for i in indices {
            set.insert(i);
        }
        set
    }

    /// Number of fields this set covers (not the number of set bits)
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether this set is a well-formed set of exactly `len` fields.
    /// Sets built here always are; deserialized ones may not be.
    pub fn fits(&self, len: usize) -> bool {
        if self.len != len || self.words.len() != (len + WORD_BITS - 1) / WORD_BITS {
            return false;
        }
        match (self.words.last(), len % WORD_BITS) {
            (Some(&last), tail) if tail != 0 => last >> tail == 0,
            _ => true,
        }
    }

    /// Whether no bit is set
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether bit `index` is set; `false` past the end
    pub fn contains(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Set bit `index`; returns whether it was newly set
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a field of this set.
    pub fn insert(&mut self, index: usize) -> bool {
        assert!(
            index < self.len,
            "field index {} out of range for {} fields",
            index,
            self.len
        );
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        let was = *word & mask != 0;
        *word |= mask;
        !was
    }

    /// Clear bit `index`; returns whether it was set. No-op past the end.
    pub fn remove(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        let was = *word & mask != 0;
        *word &= !mask;
        was
    }

    /// Clear every bit
    pub fn clear(&mut self) {
        for w in self.words.iter_mut() {
            *w = 0;
        }
    }

    /// In-place union; both sets must cover the same fields
    pub fn union_with(&mut self, other: &FieldSet) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= *b;
        }
    }

    /// In-place intersection
    pub fn intersect_with(&mut self, other: &FieldSet) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a &= *b;
        }
    }

    /// In-place difference (`self \ other`)
    pub fn difference_with(&mut self, other: &FieldSet) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a &= !*b;
        }
    }

    /// Whether every set bit of `self` is set in `other`
    pub fn is_subset(&self, other: &FieldSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & !b == 0)
    }

    /// Set bits in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |i| self.contains(*i))
    }

    /// Highest set index
    pub fn max_index(&self) -> Option<usize> {
        self.iter().last()
    }
}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
