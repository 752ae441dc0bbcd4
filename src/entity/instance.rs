use super::mask::{GroupMask, MaskTracker};
use super::state::{EntityState, LifecycleEvent};
use crate::cache::CacheItem;
use crate::core::{DbError, EntityHandle, EntityKey, FieldValue, Result, Value};
use crate::metadata::{FieldId, SlotKind, TypeLayout};
use crate::session::TransactionId;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{Level, event};

/// One managed entity: its slots plus the bookkeeping that decides what I/O
/// an access needs.
#[derive(Debug, Clone)]
pub struct EntityInstance {
    pub(crate) handle: EntityHandle,
    pub(crate) layout: Arc<TypeLayout>,
    pub(crate) state: EntityState,
    pub(crate) key: Option<EntityKey>,
    pub(crate) values: Vec<FieldValue>,
    pub(crate) masks: MaskTracker,
    /// Cache item this instance was created from, inserted as, or last published.
    pub(crate) cache_item: Option<Arc<CacheItem>>,
    /// Transaction the instance is enlisted in.
    pub(crate) transaction: Option<TransactionId>,
    pub(crate) post_load_fired: bool,
    pub(crate) created_in_transaction: bool,
    /// Written to the database by the current transaction.
    pub(crate) mutated: bool,
    pub(crate) loaded_collections: HashSet<FieldId>,
}

impl EntityInstance {
    pub(crate) fn new(handle: EntityHandle, layout: Arc<TypeLayout>, state: EntityState) -> Self {
        let values = layout.slots().iter().map(|s| default_value(&s.kind, s.columns.len())).collect();
        let masks = MaskTracker::new(layout.mask_words());
        Self {
            handle,
            layout,
            state,
            key: None,
            values,
            masks,
            cache_item: None,
            transaction: None,
            post_load_fired: false,
            created_in_transaction: false,
            mutated: false,
            loaded_collections: HashSet::new(),
        }
    }

    pub fn handle(&self) -> EntityHandle {
        self.handle
    }

    pub fn layout(&self) -> &Arc<TypeLayout> {
        &self.layout
    }

    pub fn type_name(&self) -> &str {
        self.layout.name()
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn key(&self) -> Option<&EntityKey> {
        self.key.as_ref()
    }

    pub fn load_mask(&self) -> &GroupMask {
        self.masks.load()
    }

    pub fn dirty_mask(&self) -> &GroupMask {
        self.masks.dirty()
    }

    pub fn update_mask(&self) -> &GroupMask {
        self.masks.update()
    }

    pub fn masks(&self) -> &MaskTracker {
        &self.masks
    }

    pub fn value(&self, id: FieldId) -> &FieldValue {
        &self.values[id]
    }

    pub fn version(&self) -> Option<i64> {
        let slot = self.layout.version_slot()?;
        self.values[slot.id].as_scalar().and_then(Value::as_i64)
    }

    pub(crate) fn apply(&mut self, lifecycle: LifecycleEvent) -> Result<()> {
        let next = self.state.transition(lifecycle)?;
        if next != self.state {
            event!(
                Level::TRACE,
                entity = %self.handle,
                type_name = self.layout.name(),
                from = %self.state,
                to = %next,
                "entity state transition"
            );
        }
        self.state = next;
        Ok(())
    }

    /// Assigns the primary key. A key, once set, never changes.
    pub(crate) fn assign_key(&mut self, key: EntityKey) -> Result<()> {
        if key.len() != self.layout.key_columns().len() {
            return Err(DbError::TypeMismatch(format!(
                "{} expects {} key values, got {}",
                self.layout.name(),
                self.layout.key_columns().len(),
                key.len()
            )));
        }
        for (column, value) in self.layout.key_columns().iter().zip(key.values()) {
            if value.is_null() || !column.data_type.is_compatible(value) {
                return Err(DbError::TypeMismatch(format!(
                    "key column '{}' of {} expects {}, got {}",
                    column.name,
                    self.layout.name(),
                    column.data_type,
                    value.type_name()
                )));
            }
        }
        match &self.key {
            Some(existing) if existing != &key => Err(DbError::IllegalState(format!(
                "primary key of {} is already {} and cannot change to {}",
                self.layout.name(),
                existing,
                key
            ))),
            _ => {
                self.key = Some(key);
                Ok(())
            }
        }
    }

    /// Switches to a more specific type once the discriminator is known.
    /// Layouts of a subtype extend the parent's slots and groups, so existing
    /// slot ids and mask bits keep their meaning.
    pub(crate) fn retype(&mut self, layout: Arc<TypeLayout>) {
        for slot in &layout.slots()[self.values.len()..] {
            self.values.push(default_value(&slot.kind, slot.columns.len()));
        }
        self.layout = layout;
    }

    /// Forgets loaded data and pending changes, keeping identity.
    pub(crate) fn invalidate(&mut self) {
        self.masks.reset();
        self.loaded_collections.clear();
        for (id, slot) in self.layout.slots().iter().enumerate() {
            self.values[id] = default_value(&slot.kind, slot.columns.len());
        }
    }

    pub(crate) fn key_display(&self) -> String {
        self.key
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<unassigned>".to_string())
    }

    pub fn view(&self) -> EntityView<'_> {
        EntityView { instance: self }
    }
}

pub(crate) fn default_value(kind: &SlotKind, columns: usize) -> FieldValue {
    match kind {
        SlotKind::Scalar => FieldValue::null(),
        SlotKind::Embedded { .. } => FieldValue::Embedded(vec![Value::Null; columns]),
        SlotKind::ManyToOne { .. } => FieldValue::Ref(None),
        SlotKind::OneToMany { .. } => FieldValue::Collection(Vec::new()),
    }
}

/// Read-only view handed to listeners.
pub struct EntityView<'a> {
    instance: &'a EntityInstance,
}

impl<'a> EntityView<'a> {
    pub fn type_name(&self) -> &'a str {
        self.instance.type_name()
    }

    pub fn key(&self) -> Option<&'a EntityKey> {
        self.instance.key()
    }

    pub fn state(&self) -> EntityState {
        self.instance.state
    }

    pub fn handle(&self) -> EntityHandle {
        self.instance.handle
    }

    /// Value of a field whose data is in memory; `None` if the field is
    /// unknown or its group has not been loaded.
    pub fn get(&self, name: &str) -> Option<&'a FieldValue> {
        let instance = self.instance;
        let id = instance.layout.field_id(name)?;
        let loaded = match instance.layout.slot(id).group {
            Some(group) => instance.state.is_unsaved() || instance.masks.is_group_loaded(group),
            None => instance.loaded_collections.contains(&id),
        };
        loaded.then(|| &instance.values[id])
    }
}
