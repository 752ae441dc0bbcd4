// ============================================================================
// Cache Synchronizer
// ============================================================================
//
// Moves load-group data between entities and the shared cache:
//   - read-intent loads copy single groups out of the current item,
//   - loads outside a transaction add what they read to the cache,
//   - commit publishes every loaded group of each entity it wrote,
//   - deletes and rolled-back writes evict the item.
//
// The cache stores column values, so relationship slots travel as the
// target's key and are turned back into handles on the way in.
//
// ============================================================================

use super::Session;
use crate::cache::CacheItem;
use crate::core::{DbError, EntityHandle, FieldValue, Result, Value};
use crate::entity::EntityInstance;
use std::sync::Arc;
use tracing::{Level, event};

impl Session {
    fn cache_for(&self, instance: &EntityInstance) -> Option<&Arc<crate::cache::EntityCache>> {
        self.cache
            .as_ref()
            .filter(|_| instance.layout().is_cacheable())
    }

    /// Copies `group` from the current cache item, if it holds the group.
    pub(crate) fn load_from_cache(&mut self, handle: EntityHandle, group: usize) -> Result<bool> {
        let Some(cache_key) = self.cache_key(handle)? else {
            return Ok(false);
        };
        let Some(cache) = self.cache_for(self.instance(handle)?).cloned() else {
            return Ok(false);
        };
        let Some(item) = cache.get(&cache_key)? else {
            return Ok(false);
        };
        let Some(values) = item.group(group).map(<[Value]>::to_vec) else {
            return Ok(false);
        };

        // Items of discriminated hierarchies carry the concrete type; without
        // a discriminator the item may name any type of the chain.
        let (current, discriminated) = {
            let layout = self.instance(handle)?.layout();
            (layout.name().to_string(), layout.discriminator().is_some())
        };
        let narrower = self.registry.is_subtype(item.type_name(), &current);
        let wider = self.registry.is_subtype(&current, item.type_name());
        if !narrower && !(wider && !discriminated) {
            return Ok(false);
        }
        if narrower {
            self.narrow_to(handle, item.type_name())?;
        }
        self.apply_group_values(handle, group, &values)?;
        self.instance_mut(handle)?.cache_item = Some(item);
        Ok(true)
    }

    /// Records a group read outside any transaction.
    pub(crate) fn populate_cache(
        &mut self,
        handle: EntityHandle,
        group: usize,
        values: Vec<Value>,
    ) -> Result<()> {
        let Some(cache_key) = self.cache_key(handle)? else {
            return Ok(());
        };
        let instance = self.instance(handle)?;
        let Some(cache) = self.cache_for(instance).cloned() else {
            return Ok(());
        };
        let mut item = CacheItem::new(cache_key, instance.type_name(), instance.layout().group_count());
        item.set_group(group, values);
        let published = cache.populate(item)?;
        self.instance_mut(handle)?.cache_item = Some(published);
        Ok(())
    }

    /// Column values of one loaded group, in layout column order.
    pub(crate) fn encode_group(&self, handle: EntityHandle, group: usize) -> Result<Vec<Value>> {
        let instance = self.instance(handle)?;
        let layout = instance.layout();
        let mut values = Vec::with_capacity(layout.columns_for(group).len());
        for &id in &layout.group(group).slots {
            match instance.value(id) {
                FieldValue::Scalar(value) => values.push(value.clone()),
                FieldValue::Embedded(inner) => values.extend(inner.iter().cloned()),
                FieldValue::Ref(None) => values.push(Value::Null),
                FieldValue::Ref(Some(target)) => {
                    let target = self.instance(*target)?;
                    let key = target.key().and_then(|k| k.as_column_value().cloned());
                    values.push(key.unwrap_or(Value::Null));
                }
                FieldValue::Collection(_) => {
                    return Err(DbError::IllegalState(format!(
                        "collection '{}' has no columns",
                        layout.slot(id).name
                    )));
                }
            }
        }
        Ok(values)
    }

    /// Snapshot of every loaded group, unpublished.
    pub(crate) fn snapshot_item(&self, handle: EntityHandle) -> Result<Option<CacheItem>> {
        let Some(cache_key) = self.cache_key(handle)? else {
            return Ok(None);
        };
        let instance = self.instance(handle)?;
        let mut item = CacheItem::new(cache_key, instance.type_name(), instance.layout().group_count());
        for group in instance.load_mask().iter() {
            item.set_group(group, self.encode_group(handle, group)?);
        }
        Ok(Some(item))
    }

    /// Publishes the committed view of `handle`.
    pub(crate) fn sync_to_cache(&mut self, handle: EntityHandle) -> Result<()> {
        let instance = self.instance(handle)?;
        if instance.load_mask().is_empty() {
            return Ok(());
        }
        let Some(cache) = self.cache_for(instance).cloned() else {
            return Ok(());
        };
        let Some(item) = self.snapshot_item(handle)? else {
            return Ok(());
        };
        let published = cache.publish(item)?;
        self.instance_mut(handle)?.cache_item = Some(published);
        Ok(())
    }

    pub(crate) fn evict_cached(&mut self, handle: EntityHandle) -> Result<()> {
        let Some(cache_key) = self.cache_key(handle)? else {
            return Ok(());
        };
        let Some(cache) = self.cache.clone() else {
            return Ok(());
        };
        if cache.evict(&cache_key)? {
            event!(Level::TRACE, entity = %handle, key = %cache_key, "cache item evicted");
        }
        self.instance_mut(handle)?.cache_item = None;
        Ok(())
    }
}
