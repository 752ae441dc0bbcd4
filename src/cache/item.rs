use crate::core::{EntityKey, Value};
use crate::entity::GroupMask;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Identity of a cached entity: persistable root type plus primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub root: String,
    pub key: EntityKey,
}

impl CacheKey {
    pub fn new(root: impl Into<String>, key: EntityKey) -> Self {
        Self {
            root: root.into(),
            key,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.root, self.key)
    }
}

/// Committed column values of one entity, grouped by load group.
///
/// Items are never mutated once published. Readers keep the `Arc` they were
/// handed; writers build a new item and swap it into the cache.
#[derive(Debug, Clone)]
pub struct CacheItem {
    key: CacheKey,
    type_name: String,
    load_mask: GroupMask,
    groups: Vec<Option<Arc<[Value]>>>,
    published_at: DateTime<Utc>,
}

impl CacheItem {
    pub fn new(key: CacheKey, type_name: impl Into<String>, group_count: usize) -> Self {
        Self {
            key,
            type_name: type_name.into(),
            load_mask: GroupMask::empty(group_count.div_ceil(64)),
            groups: vec![None; group_count],
            published_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Concrete type of the cached row.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn load_mask(&self) -> &GroupMask {
        &self.load_mask
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn has_group(&self, group: usize) -> bool {
        self.load_mask.contains(group)
    }

    /// Column values of `group`, in the order of the layout's group columns.
    pub fn group(&self, group: usize) -> Option<&[Value]> {
        self.groups.get(group).and_then(|g| g.as_deref())
    }

    pub fn set_group(&mut self, group: usize, values: Vec<Value>) {
        if group >= self.groups.len() {
            self.groups.resize(group + 1, None);
        }
        self.groups[group] = Some(Arc::from(values));
        self.load_mask.insert(group);
    }

    /// New item with the groups of `self` overlaid by those of `newer`.
    pub(crate) fn merged_with(&self, newer: &CacheItem) -> CacheItem {
        let mut merged = newer.clone();
        for (group, values) in self.groups.iter().enumerate() {
            if let Some(values) = values {
                if !merged.has_group(group) {
                    if group >= merged.groups.len() {
                        merged.groups.resize(group + 1, None);
                    }
                    merged.groups[group] = Some(values.clone());
                    merged.load_mask.insert(group);
                }
            }
        }
        if self.groups.len() > newer.groups.len() {
            merged.type_name = self.type_name.clone();
        }
        merged.published_at = Utc::now();
        merged
    }

    /// New item with only the groups of `other` that `self` lacks added.
    pub(crate) fn filled_from(&self, other: &CacheItem) -> Option<CacheItem> {
        let missing = other.load_mask.difference(&self.load_mask);
        if missing.is_empty() {
            return None;
        }
        let mut filled = self.clone();
        for group in missing.iter() {
            if let Some(values) = other.group(group) {
                filled.set_group(group, values.to_vec());
            }
        }
        if other.groups.len() > self.groups.len() {
            filled.type_name = other.type_name.clone();
        }
        filled.published_at = Utc::now();
        Some(filled)
    }
}
