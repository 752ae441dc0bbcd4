// ============================================================================
// Flush Engine
// ============================================================================
//
// Turns the pending state of one entity into statements:
//   PERSISTING          -> one INSERT per storage table, root first
//   update mask set     -> one UPDATE per table holding a dirty group
//   DELETING            -> one DELETE per table, most derived first
//
// Versioned entities carry `version = old` in the WHERE clause of the
// primary-table statement and write `version = old + 1`; zero affected rows
// means another transaction got there first. Masks are only cleared after
// every statement of the entity succeeded.
//
// ============================================================================

use super::Session;
use super::load::key_filter;
use crate::core::{DbError, EntityHandle, EntityKey, FieldValue, Result, Value};
use crate::entity::{EntityState, GroupMask, LifecycleEvent};
use crate::metadata::{Callback, FieldId, KeyGeneration, SlotKind, TypeLayout};
use crate::sql::Statement;
use async_recursion::async_recursion;
use std::sync::Arc;
use tracing::{Level, event};

impl Session {
    pub(crate) async fn flush_entity(&mut self, handle: EntityHandle) -> Result<()> {
        let (state, pending_update) = {
            let instance = self.instance(handle)?;
            (instance.state(), !instance.update_mask().is_empty())
        };
        match state {
            EntityState::Deleting => self.flush_delete(handle).await,
            EntityState::Persisting => self.flush_insert(handle).await,
            EntityState::Deleted | EntityState::Transient => {
                let instance = self.instance(handle)?;
                Err(DbError::IllegalState(format!(
                    "cannot flush {} {}: it is {}",
                    instance.type_name(),
                    instance.key_display(),
                    state
                )))
            }
            _ if pending_update => self.flush_update(handle).await,
            _ => Ok(()),
        }
    }

    /// INSERTs a PERSISTING entity. Re-entrant calls for an entity whose
    /// INSERT is already running return immediately.
    #[async_recursion]
    pub(crate) async fn flush_insert(&mut self, handle: EntityHandle) -> Result<()> {
        if self.instance(handle)?.state() != EntityState::Persisting
            || !self.inserting.insert(handle)
        {
            return Ok(());
        }
        let result = self.insert_rows(handle).await;
        self.inserting.remove(&handle);
        result
    }

    async fn insert_rows(&mut self, handle: EntityHandle) -> Result<()> {
        let layout = self.instance(handle)?.layout().clone();

        // References to entities not yet in the database.
        let mut deferred: Vec<FieldId> = Vec::new();
        for slot in layout.relation_slots() {
            if !matches!(slot.kind, SlotKind::ManyToOne { .. }) {
                continue;
            }
            let Some(target) = self.instance(handle)?.value(slot.id).as_ref_handle() else {
                continue;
            };
            match self.instance(target)?.state() {
                EntityState::Persisting if self.inserting.contains(&target) => {
                    deferred.push(slot.id);
                }
                EntityState::Persisting => self.flush_insert(target).await?,
                state @ (EntityState::Transient | EntityState::Deleting | EntityState::Deleted) => {
                    let target = self.instance(target)?;
                    return Err(DbError::IllegalState(format!(
                        "'{}' of {} references {} {}, which is {}",
                        slot.name,
                        layout.name(),
                        target.type_name(),
                        target.key_display(),
                        state
                    )));
                }
                _ => {}
            }
        }

        if let Some(slot) = layout.version_slot() {
            let initial = self.config.initial_version;
            self.instance_mut(handle)?.values[slot.id] = FieldValue::Scalar(Value::Integer(initial));
        }

        let generate = layout.key_generation() == KeyGeneration::Identity
            && self.instance(handle)?.key().is_none();
        let key_columns = layout.key_column_names();
        for (position, table) in layout.tables().iter().enumerate() {
            let mut values = match self.instance(handle)?.key() {
                Some(key) => key_filter(&key_columns, key),
                None => Vec::new(),
            };
            if position == 0 {
                if let Some(discriminator) = layout.discriminator() {
                    let value = discriminator.value.clone().map_or(Value::Null, Value::Text);
                    values.push((discriminator.column.clone(), value));
                }
            }
            for group in layout.groups_in_table(&table.name) {
                let encoded = self.insert_group_values(handle, &layout, group, &deferred)?;
                let names = layout.columns_for(group).iter().map(|c| c.name.clone());
                values.extend(names.zip(encoded));
            }

            let returning = position == 0 && generate;
            let outcome = self
                .run_insert(&Statement::insert(table.name.clone(), values), returning)
                .await?;
            if returning {
                let generated = outcome.generated_key.ok_or_else(|| {
                    DbError::ExecutionError(format!(
                        "INSERT into {} returned no generated key",
                        table.name
                    ))
                })?;
                self.instance_mut(handle)?.assign_key(EntityKey::single(generated))?;
                self.register_identity(handle)?;
            }
        }

        let pending = self.snapshot_item(handle)?.map(Arc::new);
        {
            let instance = self.instance_mut(handle)?;
            instance.masks.mark_loaded(&GroupMask::full(layout.group_count()));
            instance.apply(LifecycleEvent::Inserted)?;
            instance.mutated = true;
            instance.cache_item = pending;
        }
        if !deferred.is_empty() {
            // Written NULL above; a later UPDATE stores the real key.
            let groups = deferred.iter().filter_map(|&id| layout.slot(id).group);
            let mask = GroupMask::from_groups(layout.mask_words(), groups);
            self.instance_mut(handle)?.masks.mark_dirty(&mask)?;
        }
        event!(
            Level::DEBUG,
            entity = %handle,
            type_name = layout.name(),
            key = %self.instance(handle)?.key_display(),
            "entity inserted"
        );
        self.fire(handle, Callback::PostPersist)
    }

    fn insert_group_values(
        &self,
        handle: EntityHandle,
        layout: &TypeLayout,
        group: usize,
        deferred: &[FieldId],
    ) -> Result<Vec<Value>> {
        let mut values = self.encode_group(handle, group)?;
        let mut offset = 0;
        for &id in &layout.group(group).slots {
            let width = layout.slot(id).columns.len();
            if deferred.contains(&id) {
                values[offset..offset + width].fill(Value::Null);
            }
            offset += width;
        }
        Ok(values)
    }

    /// UPDATEs the columns of every group in the update mask.
    pub(crate) async fn flush_update(&mut self, handle: EntityHandle) -> Result<()> {
        let (layout, key, update, old_version) = {
            let instance = self.instance(handle)?;
            (
                instance.layout().clone(),
                self.require_key(handle)?,
                instance.update_mask().clone(),
                instance.version(),
            )
        };
        if update.is_empty() {
            return Ok(());
        }
        let version_column = layout.version_slot().map(|slot| slot.columns[0].name.clone());
        let version = match (&version_column, old_version) {
            (Some(column), Some(old)) => Some((column.as_str(), old)),
            (Some(_), None) => {
                return Err(DbError::IllegalState(format!(
                    "version of {} {} is not loaded",
                    layout.name(),
                    key
                )));
            }
            (None, _) => None,
        };

        self.fire(handle, Callback::PreUpdate)?;

        let primary = layout.primary_table().to_string();
        let mut primary_written = false;
        for table in layout.tables() {
            let mut set: Vec<(String, Value)> = Vec::new();
            for group in update.iter().filter(|&g| layout.group(g).table == table.name) {
                let encoded = self.encode_group(handle, group)?;
                for (column, value) in layout.columns_for(group).iter().zip(encoded) {
                    if Some(&column.name) != version_column.as_ref() {
                        set.push((column.name.clone(), value));
                    }
                }
            }
            if set.is_empty() {
                continue;
            }
            let is_primary = table.name == primary;
            let checked = if is_primary { version } else { None };
            self.update_row(&layout, &key, &table.name, set, checked).await?;
            primary_written |= is_primary;
        }
        if version.is_some() && !primary_written {
            self.update_row(&layout, &key, &primary, Vec::new(), version).await?;
        }

        {
            let instance = self.instance_mut(handle)?;
            if let (Some(slot), Some((_, old))) = (layout.version_slot(), version) {
                instance.values[slot.id] = FieldValue::Scalar(Value::Integer(old + 1));
            }
            instance.masks.clear_dirty_after_flush();
            instance.mutated = true;
        }
        event!(
            Level::DEBUG,
            entity = %handle,
            type_name = layout.name(),
            key = %key,
            groups = ?update,
            "entity updated"
        );
        self.fire(handle, Callback::PostUpdate)
    }

    async fn update_row(
        &mut self,
        layout: &TypeLayout,
        key: &EntityKey,
        table: &str,
        mut set: Vec<(String, Value)>,
        version: Option<(&str, i64)>,
    ) -> Result<()> {
        let mut filter = key_filter(&layout.key_column_names(), key);
        if let Some((column, old)) = version {
            set.push((column.to_string(), Value::Integer(old + 1)));
            filter.push((column.to_string(), Value::Integer(old)));
        }
        let affected = self
            .run_execute(&Statement::update(table, set, filter))
            .await?;
        if affected == 0 {
            return Err(conflict(layout, key, version.map(|(_, old)| old)));
        }
        Ok(())
    }

    /// DELETEs the rows of a DELETING entity, most derived table first.
    pub(crate) async fn flush_delete(&mut self, handle: EntityHandle) -> Result<()> {
        let (layout, key, version) = {
            let instance = self.instance(handle)?;
            if instance.state() != EntityState::Deleting {
                return Ok(());
            }
            (
                instance.layout().clone(),
                self.require_key(handle)?,
                instance.version(),
            )
        };
        let key_columns = layout.key_column_names();
        for (position, table) in layout.tables().iter().enumerate().rev() {
            let mut filter = key_filter(&key_columns, &key);
            let checked = if position == 0 { version } else { None };
            if let (Some(slot), Some(old)) = (layout.version_slot(), checked) {
                filter.push((slot.columns[0].name.clone(), Value::Integer(old)));
            }
            let affected = self
                .run_execute(&Statement::delete(table.name.clone(), filter))
                .await?;
            if affected == 0 && position == 0 {
                return Err(conflict(&layout, &key, checked));
            }
        }

        {
            let instance = self.instance_mut(handle)?;
            instance.apply(LifecycleEvent::DeleteFlushed)?;
            instance.masks.clear_dirty_after_flush();
            instance.mutated = true;
        }
        event!(
            Level::DEBUG,
            entity = %handle,
            type_name = layout.name(),
            key = %key,
            "entity deleted"
        );
        self.fire(handle, Callback::PostRemove)
    }
}

fn conflict(layout: &TypeLayout, key: &EntityKey, version: Option<i64>) -> DbError {
    match version {
        Some(version) => {
            event!(
                Level::WARN,
                type_name = layout.name(),
                key = %key,
                version,
                "optimistic lock conflict"
            );
            DbError::OptimisticLock {
                type_name: layout.name().to_string(),
                key: key.to_string(),
                version,
            }
        }
        None => DbError::NotFound {
            type_name: layout.name().to_string(),
            key: key.to_string(),
        },
    }
}
