// ============================================================================
// Cascade Engine
// ============================================================================
//
// Persist and remove propagate along relationships whose cascade set names
// the operation:
//
//   PRE-PERSIST   many-to-one targets, before the owner's INSERT
//   POST-PERSIST  one-to-many children, once the owner has a key
//   PRE-REMOVE    one-to-many children, so they are deleted first
//   POST-REMOVE   many-to-one targets, after the owner
//
// A (handle, operation) pair is visited at most once per transaction, which
// is what stops walks over cyclic graphs.
//
// ============================================================================

use super::Session;
use super::load::LoadIntent;
use crate::core::{DbError, EntityHandle, FieldValue, Result};
use crate::entity::{EntityState, LifecycleEvent, MaskTracker};
use crate::metadata::{Callback, FieldId, KeyGeneration, SlotKind};
use async_recursion::async_recursion;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    Persist,
    Remove,
}

impl Session {
    #[async_recursion]
    pub(crate) async fn persist_entity(&mut self, handle: EntityHandle) -> Result<()> {
        if !self.scope_mut()?.visit(handle, CascadeOp::Persist) {
            event!(Level::TRACE, entity = %handle, "persist cascade already visited");
            return Ok(());
        }
        let (state, layout) = {
            let instance = self.instance(handle)?;
            (instance.state(), instance.layout().clone())
        };
        match state {
            EntityState::Transient => {}
            EntityState::Deleting | EntityState::Deleted => {
                return Err(DbError::IllegalState(format!(
                    "cannot persist {} {}: it is {}",
                    layout.name(),
                    self.instance(handle)?.key_display(),
                    state
                )));
            }
            _ => return Ok(()),
        }
        let has_key = self.instance(handle)?.key().is_some();
        if layout.key_generation() == KeyGeneration::Assigned && !has_key {
            return Err(DbError::IllegalState(format!(
                "{} {} needs an assigned primary key before it can be persisted",
                layout.name(),
                handle
            )));
        }

        self.fire(handle, Callback::PrePersist)?;
        self.register_identity(handle)?;
        let tx_id = self.current_transaction_id();
        {
            let instance = self.instance_mut(handle)?;
            instance.apply(LifecycleEvent::Create)?;
            instance.masks = MaskTracker::new(layout.mask_words());
            instance.transaction = tx_id;
            instance.created_in_transaction = true;
            instance.post_load_fired = true;
        }
        self.scope_mut()?.enlist(handle);

        for slot in layout.relation_slots().filter(|s| s.cascade.persist) {
            if let SlotKind::ManyToOne { .. } = slot.kind {
                if let Some(target) = self.instance(handle)?.value(slot.id).as_ref_handle() {
                    if self.instance(target)?.state() == EntityState::Transient {
                        self.persist_entity(target).await?;
                    }
                }
            }
        }

        if layout.key_generation() == KeyGeneration::Assigned
            && self.instance(handle)?.state() == EntityState::Persisting
        {
            self.flush_insert(handle).await?;
        }

        for slot in layout.relation_slots().filter(|s| s.cascade.persist) {
            if let SlotKind::OneToMany { mapped_by, .. } = &slot.kind {
                for child in self.collection_items(handle, slot.id) {
                    if self.instance(child)?.state() != EntityState::Transient {
                        continue;
                    }
                    self.link_owner(child, mapped_by, handle)?;
                    self.persist_entity(child).await?;
                }
            }
        }
        Ok(())
    }

    #[async_recursion]
    pub(crate) async fn remove_entity(&mut self, handle: EntityHandle) -> Result<()> {
        let (state, layout) = {
            let instance = self.instance(handle)?;
            (instance.state(), instance.layout().clone())
        };
        match state {
            EntityState::Deleting | EntityState::Deleted => return Ok(()),
            EntityState::Transient => {
                return Err(DbError::IllegalState(format!(
                    "cannot remove {} {}: it is not managed",
                    layout.name(),
                    handle
                )));
            }
            _ => {}
        }
        if !self.scope_mut()?.visit(handle, CascadeOp::Remove) {
            event!(Level::TRACE, entity = %handle, "remove cascade already visited");
            return Ok(());
        }

        if state == EntityState::Persisting {
            for slot in layout.relation_slots().filter(|s| s.cascade.remove) {
                if let SlotKind::OneToMany { .. } = slot.kind {
                    for child in self.collection_items(handle, slot.id) {
                        if self.instance(child)?.state() != EntityState::Transient {
                            self.remove_entity(child).await?;
                        }
                    }
                }
            }
            self.unregister_identity(handle)?;
            {
                let instance = self.instance_mut(handle)?;
                instance.apply(LifecycleEvent::Remove)?;
                instance.transaction = None;
                instance.created_in_transaction = false;
            }
            // Back to TRANSIENT: a later create starts from scratch.
            self.scope_mut()?.forget(handle);
            return Ok(());
        }

        self.promote(handle, LoadIntent::Write).await?;
        if layout.version_slot().is_some() {
            self.load_group(handle, 0, LoadIntent::Write).await?;
        }

        for slot in layout.relation_slots().filter(|s| s.cascade.remove) {
            if let SlotKind::OneToMany { .. } = slot.kind {
                self.load_collection(handle, slot.id).await?;
                for child in self.collection_items(handle, slot.id) {
                    self.remove_entity(child).await?;
                }
            }
        }

        self.fire(handle, Callback::PreRemove)?;
        self.apply(handle, LifecycleEvent::Remove)?;
        self.instance_mut(handle)?.mutated = true;
        self.scope_mut()?.schedule_removal(handle);

        for slot in layout.relation_slots().filter(|s| s.cascade.remove) {
            if let (SlotKind::ManyToOne { .. }, Some(group)) = (&slot.kind, slot.group) {
                self.load_group(handle, group, LoadIntent::Read).await?;
                if let Some(target) = self.instance(handle)?.value(slot.id).as_ref_handle() {
                    self.remove_entity(target).await?;
                }
            }
        }
        Ok(())
    }

    fn collection_items(&self, handle: EntityHandle, id: FieldId) -> Vec<EntityHandle> {
        self.instance(handle)
            .ok()
            .and_then(|instance| instance.value(id).as_collection().map(<[EntityHandle]>::to_vec))
            .unwrap_or_default()
    }

    /// Points an unsaved child's owning reference at `owner` when it is unset.
    fn link_owner(&mut self, child: EntityHandle, mapped_by: &str, owner: EntityHandle) -> Result<()> {
        let instance = self.instance_mut(child)?;
        let Some(id) = instance.layout().field_id(mapped_by) else {
            return Ok(());
        };
        if matches!(instance.values[id], FieldValue::Ref(None)) {
            instance.values[id] = FieldValue::Ref(Some(owner));
        }
        Ok(())
    }
}
