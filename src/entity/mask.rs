// ============================================================================
// Load-Group Bitmasks
// ============================================================================
//
// Group `g` lives at word `g / 64`, bit `g % 64`. Masks of one entity always
// have the same width, taken from its type layout.
//
// ============================================================================

use crate::core::{DbError, Result};
use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct GroupMask {
    words: Vec<u64>,
}

impl GroupMask {
    pub fn empty(words: usize) -> Self {
        Self {
            words: vec![0; words.max(1)],
        }
    }

    /// Mask with groups `0..groups` set.
    pub fn full(groups: usize) -> Self {
        let mut mask = Self::empty(groups.div_ceil(64));
        for group in 0..groups {
            mask.insert(group);
        }
        mask
    }

    pub fn single(words: usize, group: usize) -> Self {
        let mut mask = Self::empty(words);
        mask.insert(group);
        mask
    }

    pub fn from_groups(words: usize, groups: impl IntoIterator<Item = usize>) -> Self {
        let mut mask = Self::empty(words);
        for group in groups {
            mask.insert(group);
        }
        mask
    }

    pub fn insert(&mut self, group: usize) {
        let word = group / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (group % 64);
    }

    pub fn remove(&mut self, group: usize) {
        if let Some(word) = self.words.get_mut(group / 64) {
            *word &= !(1u64 << (group % 64));
        }
    }

    pub fn contains(&self, group: usize) -> bool {
        self.words
            .get(group / 64)
            .is_some_and(|word| word & (1u64 << (group % 64)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn union_with(&mut self, other: &GroupMask) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst |= *src;
        }
    }

    pub fn union(&self, other: &GroupMask) -> GroupMask {
        let mut result = self.clone();
        result.union_with(other);
        result
    }

    /// Groups in `self` that are not in `other`.
    pub fn difference(&self, other: &GroupMask) -> GroupMask {
        let words = self
            .words
            .iter()
            .enumerate()
            .map(|(idx, word)| word & !other.words.get(idx).copied().unwrap_or(0))
            .collect();
        GroupMask { words }
    }

    pub fn is_subset(&self, other: &GroupMask) -> bool {
        self.difference(other).is_empty()
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set groups in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, word)| {
            let word = *word;
            (0..64)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| idx * 64 + bit)
        })
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }
}

impl fmt::Debug for GroupMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Per-instance load, dirty and update masks.
///
/// Invariant: `dirty` and `update` are always subsets of `load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskTracker {
    load: GroupMask,
    dirty: GroupMask,
    update: GroupMask,
}

impl MaskTracker {
    pub fn new(words: usize) -> Self {
        Self {
            load: GroupMask::empty(words),
            dirty: GroupMask::empty(words),
            update: GroupMask::empty(words),
        }
    }

    pub fn load(&self) -> &GroupMask {
        &self.load
    }

    pub fn dirty(&self) -> &GroupMask {
        &self.dirty
    }

    pub fn update(&self) -> &GroupMask {
        &self.update
    }

    pub fn mark_loaded(&mut self, groups: &GroupMask) {
        self.load.union_with(groups);
    }

    /// Mutated groups must already be loaded.
    pub fn mark_dirty(&mut self, groups: &GroupMask) -> Result<()> {
        if !groups.is_subset(&self.load) {
            return Err(DbError::IllegalState(format!(
                "cannot mark groups {:?} dirty, only {:?} are loaded",
                groups.difference(&self.load),
                self.load
            )));
        }
        self.dirty.union_with(groups);
        self.update.union_with(groups);
        Ok(())
    }

    /// Called only after every statement of a flush succeeded.
    pub fn clear_dirty_after_flush(&mut self) {
        self.dirty.clear();
        self.update.clear();
    }

    /// Forgets everything: after rollback nothing in memory is trusted.
    pub fn reset(&mut self) {
        self.load.clear();
        self.dirty.clear();
        self.update.clear();
    }

    pub fn is_group_loaded(&self, group: usize) -> bool {
        self.load.contains(group)
    }

    pub fn any_dirty(&self) -> bool {
        !self.dirty.is_empty() || !self.update.is_empty()
    }

    pub fn dirty_implies_loaded(&self) -> bool {
        self.dirty.is_subset(&self.load) && self.update.is_subset(&self.load)
    }
}
