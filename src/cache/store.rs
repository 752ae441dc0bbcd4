// ============================================================================
// Shared Entity Cache
// ============================================================================
//
// The only object shared between sessions. The map is guarded by a mutex that
// is held just long enough to read or swap an `Arc<CacheItem>`; items
// themselves are immutable, so a session reading an old item never observes a
// partial update.
//
// ============================================================================

use super::item::{CacheItem, CacheKey};
use crate::core::Result;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub publishes: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct EntityCache {
    items: Mutex<LruCache<CacheKey, Arc<CacheItem>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    publishes: AtomicU64,
    evictions: AtomicU64,
}

impl EntityCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            items: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            publishes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<Arc<CacheItem>>> {
        let item = self.items.lock()?.get(key).cloned();
        let counter = if item.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        event!(Level::TRACE, key = %key, hit = item.is_some(), "cache lookup");
        Ok(item)
    }

    /// Publishes committed state: the new item is the union of the current
    /// item (if any) and `item`, with `item` winning for groups both hold.
    pub fn publish(&self, item: CacheItem) -> Result<Arc<CacheItem>> {
        let mut items = self.items.lock()?;
        let published = match items.peek(item.key()) {
            Some(current) => Arc::new(current.merged_with(&item)),
            None => Arc::new(item),
        };
        items.put(published.key().clone(), published.clone());
        drop(items);

        self.publishes.fetch_add(1, Ordering::Relaxed);
        event!(
            Level::TRACE,
            key = %published.key(),
            groups = ?published.load_mask(),
            "cache item published"
        );
        Ok(published)
    }

    /// Records data read outside a transaction: creates the item if absent,
    /// otherwise adds only the groups the current item lacks.
    pub fn populate(&self, item: CacheItem) -> Result<Arc<CacheItem>> {
        let mut items = self.items.lock()?;
        let published = match items.peek(item.key()) {
            Some(current) => match current.filled_from(&item) {
                Some(filled) => Arc::new(filled),
                None => return Ok(current.clone()),
            },
            None => Arc::new(item),
        };
        items.put(published.key().clone(), published.clone());
        drop(items);

        self.publishes.fetch_add(1, Ordering::Relaxed);
        event!(
            Level::TRACE,
            key = %published.key(),
            groups = ?published.load_mask(),
            "cache item populated"
        );
        Ok(published)
    }

    pub fn evict(&self, key: &CacheKey) -> Result<bool> {
        let removed = self.items.lock()?.pop(key).is_some();
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            event!(Level::TRACE, key = %key, "cache item evicted");
        }
        Ok(removed)
    }

    pub fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.items.lock()?.contains(key))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.items.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.items.lock()?.is_empty())
    }

    pub fn clear(&self) -> Result<()> {
        self.items.lock()?.clear();
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntityKey, Value};

    fn key(id: i64) -> CacheKey {
        CacheKey::new("Book", EntityKey::from(id))
    }

    fn item(id: i64, group: usize, value: &str) -> CacheItem {
        let mut item = CacheItem::new(key(id), "Book", 2);
        item.set_group(group, vec![Value::from(value)]);
        item
    }

    #[test]
    fn test_publish_replaces_without_touching_readers() {
        let cache = EntityCache::new(16);
        cache.publish(item(1, 0, "old")).unwrap();
        let reader = cache.get(&key(1)).unwrap().unwrap();

        cache.publish(item(1, 0, "new")).unwrap();
        let current = cache.get(&key(1)).unwrap().unwrap();

        assert_eq!(reader.group(0), Some(&[Value::from("old")][..]));
        assert_eq!(current.group(0), Some(&[Value::from("new")][..]));
        assert!(!Arc::ptr_eq(&reader, &current));
    }

    #[test]
    fn test_populate_keeps_existing_groups() {
        let cache = EntityCache::new(16);
        cache.publish(item(1, 0, "committed")).unwrap();
        let mut read = item(1, 0, "stale");
        read.set_group(1, vec![Value::from("extra")]);
        let current = cache.populate(read).unwrap();
        assert_eq!(current.group(0), Some(&[Value::from("committed")][..]));
        assert_eq!(current.group(1), Some(&[Value::from("extra")][..]));
    }

    #[test]
    fn test_lru_capacity_and_stats() {
        let cache = EntityCache::new(2);
        cache.publish(item(1, 0, "a")).unwrap();
        cache.publish(item(2, 0, "b")).unwrap();
        cache.publish(item(3, 0, "c")).unwrap();
        assert_eq!(cache.len().unwrap(), 2);
        assert!(cache.get(&key(1)).unwrap().is_none());
        assert!(cache.get(&key(3)).unwrap().is_some());
        assert!(cache.evict(&key(3)).unwrap());
        assert!(!cache.evict(&key(3)).unwrap());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.publishes, 3);
        assert_eq!(stats.evictions, 1);
    }
}
