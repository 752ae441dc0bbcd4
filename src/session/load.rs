// ============================================================================
// Load Engine
// ============================================================================
//
// `load_group` brings one load group of an entity into memory with at most
// one SELECT:
//   1. already loaded          -> no I/O
//   2. first touch in a tx     -> promote (enlist, forget the old view)
//   3. read intent, cache hit  -> copy the group from the cache item
//   4. otherwise               -> SELECT the group's columns by key
//
// Write intent never trusts the cache: a group that is about to be modified
// is always read from the database inside the transaction.
//
// ============================================================================

use super::Session;
use crate::cache::CacheKey;
use crate::core::{DbError, EntityHandle, EntityKey, FieldValue, Result, Value};
use crate::entity::{EntityState, GroupMask, LifecycleEvent};
use crate::metadata::{Callback, FieldId, SlotKind};
use crate::sql::Statement;
use async_recursion::async_recursion;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadIntent {
    Read,
    Write,
}

impl Session {
    /// Joins `handle` to the current transaction on its first access there.
    ///
    /// Data loaded before the transaction is no longer trusted: the masks
    /// are reset and, for write intent with `reload_on_promotion`, every
    /// previously loaded group is read again right away.
    pub(crate) async fn promote(&mut self, handle: EntityHandle, intent: LoadIntent) -> Result<()> {
        let Some(tx_id) = self.current_transaction_id() else {
            return Ok(());
        };
        let stale = {
            let instance = self.instance_mut(handle)?;
            if instance.transaction == Some(tx_id) {
                return Ok(());
            }
            if !matches!(
                instance.state(),
                EntityState::NonTransactional | EntityState::Transactional | EntityState::Persisted
            ) {
                return Ok(());
            }
            instance.apply(LifecycleEvent::Promote)?;
            let stale = instance.load_mask().clone();
            instance.masks.reset();
            instance.loaded_collections.clear();
            instance.transaction = Some(tx_id);
            stale
        };
        self.scope_mut()?.enlist(handle);
        event!(
            Level::TRACE,
            entity = %handle,
            transaction = %tx_id,
            stale = ?stale,
            "entity promoted"
        );

        if intent == LoadIntent::Write && self.config.reload_on_promotion {
            for group in stale.iter() {
                self.select_group(handle, group).await?;
            }
        }
        Ok(())
    }

    /// Ensures `group` of `handle` holds valid data.
    ///
    /// # Panics
    /// Panics if `group` is not a load group of the entity's type.
    #[async_recursion]
    pub(crate) async fn load_group(
        &mut self,
        handle: EntityHandle,
        group: usize,
        intent: LoadIntent,
    ) -> Result<()> {
        let (state, layout) = {
            let instance = self.instance(handle)?;
            (instance.state(), instance.layout().clone())
        };
        assert!(
            group < layout.group_count(),
            "{} has no load group {}",
            layout.name(),
            group
        );
        if state == EntityState::Deleted || state.is_unsaved() {
            return Ok(());
        }

        self.promote(handle, intent).await?;
        if self.instance(handle)?.masks().is_group_loaded(group) {
            return Ok(());
        }

        // The root group resolves the concrete type of a polymorphic row.
        if group != 0
            && layout.discriminator().is_some()
            && !self.instance(handle)?.masks().is_group_loaded(0)
        {
            self.load_group(handle, 0, intent).await?;
            if self.instance(handle)?.masks().is_group_loaded(group) {
                return Ok(());
            }
        }

        if intent == LoadIntent::Read && self.load_from_cache(handle, group)? {
            event!(Level::TRACE, entity = %handle, group, "group served from cache");
        } else {
            self.select_group(handle, group).await?;
        }

        if group == 0 {
            self.fire_post_load(handle)?;
        }
        Ok(())
    }

    /// SELECTs one group by primary key and copies the row into the entity.
    pub(crate) async fn select_group(&mut self, handle: EntityHandle, group: usize) -> Result<()> {
        let (layout, key) = {
            let instance = self.instance(handle)?;
            (instance.layout().clone(), self.require_key(handle)?)
        };
        let mut columns: Vec<String> = layout
            .select_columns(group)
            .into_iter()
            .map(str::to_string)
            .collect();
        let probe_only = columns.is_empty();
        if probe_only {
            columns = layout.key_column_names().into_iter().map(str::to_string).collect();
        }
        let statement = Statement::select(
            layout.group(group).table.clone(),
            columns,
            key_filter(&layout.key_column_names(), &key),
        );
        let rows = self.run_query(&statement).await?;
        let Some(mut row) = rows.into_iter().next() else {
            return Err(DbError::NotFound {
                type_name: layout.name().to_string(),
                key: key.to_string(),
            });
        };

        if probe_only {
            row.clear();
        }
        if group == 0 && layout.discriminator().is_some() {
            let discriminator = row.pop().unwrap_or(Value::Null);
            self.resolve_subtype(handle, &discriminator)?;
        }

        self.apply_group_values(handle, group, &row)?;
        if self.current_transaction_id().is_none() {
            self.apply(handle, LifecycleEvent::LoadedOutsideTransaction)?;
            self.populate_cache(handle, group, row)?;
        }
        Ok(())
    }

    /// Narrows the entity to the concrete type named by a discriminator value.
    fn resolve_subtype(&mut self, handle: EntityHandle, discriminator: &Value) -> Result<()> {
        let instance = self.instance(handle)?;
        let layout = instance.layout().clone();
        let Some(value) = discriminator.as_str() else {
            return Err(DbError::TypeMismatch(format!(
                "{} {} has no discriminator value",
                layout.name(),
                instance.key_display()
            )));
        };
        let concrete = self.registry.resolve_discriminator(layout.root(), value)?;
        self.narrow_to(handle, concrete.name())
    }

    /// Retypes to the concrete `type_name` when it is a subtype of the
    /// current type. A row of any other type means the entity does not exist
    /// under the requested type.
    pub(crate) fn narrow_to(&mut self, handle: EntityHandle, type_name: &str) -> Result<()> {
        let instance = self.instance(handle)?;
        let current = instance.layout().name().to_string();
        if current == type_name {
            return Ok(());
        }
        if !self.registry.is_subtype(type_name, &current) {
            return Err(DbError::NotFound {
                type_name: current,
                key: instance.key_display(),
            });
        }
        let concrete = self.registry.layout(type_name)?;
        self.instance_mut(handle)?.retype(concrete);
        event!(Level::TRACE, entity = %handle, from = %current, to = %type_name, "entity narrowed");
        Ok(())
    }

    /// Copies column values of `group` into the entity's slots and marks the
    /// group loaded.
    pub(crate) fn apply_group_values(
        &mut self,
        handle: EntityHandle,
        group: usize,
        values: &[Value],
    ) -> Result<()> {
        let layout = self.instance(handle)?.layout().clone();
        let expected = layout.columns_for(group).len();
        if values.len() != expected {
            return Err(DbError::ExecutionError(format!(
                "group {} of {} has {} columns, row has {}",
                group,
                layout.name(),
                expected,
                values.len()
            )));
        }

        let mut decoded: Vec<(FieldId, FieldValue)> = Vec::new();
        let mut offset = 0;
        for &id in &layout.group(group).slots {
            let slot = layout.slot(id);
            let width = slot.columns.len();
            let columns = &values[offset..offset + width];
            offset += width;
            let value = match &slot.kind {
                SlotKind::Scalar => FieldValue::Scalar(columns[0].clone()),
                SlotKind::Embedded { .. } => FieldValue::Embedded(columns.to_vec()),
                SlotKind::ManyToOne { target } => {
                    if columns[0].is_null() {
                        FieldValue::Ref(None)
                    } else {
                        let target = self.reference(target, EntityKey::single(columns[0].clone()))?;
                        FieldValue::Ref(Some(target))
                    }
                }
                SlotKind::OneToMany { .. } => continue,
            };
            decoded.push((id, value));
        }

        let instance = self.instance_mut(handle)?;
        for (id, value) in decoded {
            instance.values[id] = value;
        }
        let words = layout.mask_words();
        instance.masks.mark_loaded(&GroupMask::single(words, group));
        Ok(())
    }

    /// Loads an inverse one-to-many collection by selecting the keys of the
    /// children whose owning reference points at this entity.
    pub(crate) async fn load_collection(&mut self, handle: EntityHandle, id: FieldId) -> Result<()> {
        let (state, layout) = {
            let instance = self.instance(handle)?;
            (instance.state(), instance.layout().clone())
        };
        if state == EntityState::Deleted || state.is_unsaved() {
            return Ok(());
        }
        self.promote(handle, LoadIntent::Read).await?;
        if self.instance(handle)?.loaded_collections.contains(&id) {
            return Ok(());
        }

        let SlotKind::OneToMany { target, mapped_by } = &layout.slot(id).kind else {
            return Err(DbError::IllegalState(format!(
                "'{}' is not a collection",
                layout.slot(id).name
            )));
        };
        let key = self.require_key(handle)?;
        let target_layout = self.registry.layout(target)?;
        let owner_column = target_layout.field(mapped_by)?.columns[0].clone();
        let key_value = key.as_column_value().cloned().ok_or_else(|| {
            DbError::IllegalState(format!("{} does not have a single-column key", layout.name()))
        })?;
        let key_columns: Vec<String> = target_layout
            .key_column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let statement = Statement::select(
            owner_column.table.clone(),
            key_columns,
            vec![(owner_column.name.clone(), key_value)],
        );
        let rows = self.run_query(&statement).await?;

        let mut children = Vec::with_capacity(rows.len());
        for row in rows {
            children.push(self.reference(target, EntityKey::new(row))?);
        }
        let instance = self.instance_mut(handle)?;
        instance.values[id] = FieldValue::Collection(children);
        instance.loaded_collections.insert(id);
        Ok(())
    }

    pub(crate) fn require_key(&self, handle: EntityHandle) -> Result<EntityKey> {
        let instance = self.instance(handle)?;
        instance.key().cloned().ok_or_else(|| {
            DbError::IllegalState(format!(
                "{} {} has no primary key yet",
                instance.type_name(),
                handle
            ))
        })
    }

    pub(crate) fn cache_key(&self, handle: EntityHandle) -> Result<Option<CacheKey>> {
        let instance = self.instance(handle)?;
        Ok(instance
            .key()
            .map(|key| CacheKey::new(instance.layout().root(), key.clone())))
    }

    fn fire_post_load(&mut self, handle: EntityHandle) -> Result<()> {
        if self.instance(handle)?.post_load_fired {
            return Ok(());
        }
        self.instance_mut(handle)?.post_load_fired = true;
        self.fire(handle, Callback::PostLoad)
    }
}

pub(crate) fn key_filter(columns: &[&str], key: &EntityKey) -> Vec<(String, Value)> {
    columns
        .iter()
        .map(|c| c.to_string())
        .zip(key.values().iter().cloned())
        .collect()
}
