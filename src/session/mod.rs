// ============================================================================
// Session
// ============================================================================
//
// A session owns one connection, the entity instances materialised through
// it (an arena addressed by `EntityHandle`), an identity map keyed by root
// type and primary key, and at most one open transaction.
//
// The engines live in separate files as further `impl Session` blocks:
//   load.rs     - load engine (group loads, promotion, collections)
//   flush.rs    - flush engine (INSERT / UPDATE / DELETE)
//   cascade.rs  - persist / remove propagation
//   sync.rs     - cache synchronizer
//   context.rs  - begin / commit / rollback
//   callbacks.rs - lifecycle listeners
//
// ============================================================================

pub mod callbacks;
pub mod cascade;
pub mod context;
pub mod flush;
pub mod load;
pub mod sync;
pub mod transaction;

pub use cascade::CascadeOp;
pub use context::TransactionContext;
pub use load::LoadIntent;
pub use transaction::{TransactionHook, TransactionId, TransactionScope, TransactionState};

use crate::cache::{CacheItem, EntityCache};
use crate::config::RuntimeConfig;
use crate::core::{DbError, EntityHandle, EntityKey, FieldValue, Result, SessionId};
use crate::entity::{EntityInstance, EntityState, GroupMask, LifecycleEvent};
use crate::metadata::{KeyGeneration, SlotKind, SlotLayout, TypeLayout, TypeRegistry};
use crate::sql::{InsertOutcome, RowSet, SqlConnection, Statement};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{Level, event};

pub struct Session {
    id: SessionId,
    registry: Arc<TypeRegistry>,
    cache: Option<Arc<EntityCache>>,
    config: RuntimeConfig,
    connection: Box<dyn SqlConnection>,
    entities: Vec<EntityInstance>,
    identity: HashMap<(String, EntityKey), EntityHandle>,
    transaction: Option<TransactionScope>,
    /// Entities whose INSERT is in progress; a reference back to one of them
    /// is written NULL and fixed by a later UPDATE.
    inserting: HashSet<EntityHandle>,
}

impl Session {
    pub fn new(
        registry: Arc<TypeRegistry>,
        cache: Option<Arc<EntityCache>>,
        config: RuntimeConfig,
        connection: Box<dyn SqlConnection>,
    ) -> Self {
        let id = SessionId::new();
        event!(Level::DEBUG, session = %id, "session opened");
        Self {
            id,
            registry,
            cache,
            config,
            connection,
            entities: Vec::new(),
            identity: HashMap::new(),
            transaction: None,
            inserting: HashSet::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Rolls back an open transaction and releases the connection.
    pub async fn close(mut self) -> Result<()> {
        if self.transaction.is_some() {
            self.rollback().await?;
        }
        event!(Level::DEBUG, session = %self.id, entities = self.entities.len(), "session closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Application surface
    // ------------------------------------------------------------------

    /// New TRANSIENT instance of `type_name`.
    pub fn new_entity(&mut self, type_name: &str) -> Result<EntityHandle> {
        let layout = self.registry.layout(type_name)?;
        Ok(self.push_instance(layout, EntityState::Transient))
    }

    /// Assigns the primary key of an entity that has not been inserted yet.
    pub fn set_key(&mut self, handle: EntityHandle, key: impl Into<EntityKey>) -> Result<()> {
        let instance = self.instance_mut(handle)?;
        if !instance.state().is_unsaved() {
            return Err(DbError::IllegalState(format!(
                "primary key of {} {} cannot change once it is stored",
                instance.type_name(),
                instance.key_display()
            )));
        }
        instance.assign_key(key.into())
    }

    /// Registers a TRANSIENT entity for insertion in the current transaction.
    pub async fn create(&mut self, handle: EntityHandle) -> Result<()> {
        self.require_transaction()?;
        self.persist_entity(handle).await
    }

    /// Entity of `type_name` (or a subtype) stored under `key`.
    pub async fn find(
        &mut self,
        type_name: &str,
        key: impl Into<EntityKey>,
    ) -> Result<EntityHandle> {
        let key = key.into();
        let layout = self.registry.layout(type_name)?;
        let mapped = self.identity.contains_key(&(layout.root().to_string(), key.clone()));
        let handle = self.reference(type_name, key.clone())?;

        if self.instance(handle)?.state().is_removed() {
            return Err(DbError::NotFound {
                type_name: type_name.to_string(),
                key: key.to_string(),
            });
        }
        match self.load_group(handle, 0, LoadIntent::Read).await {
            Err(err) if err.is_not_found() && !mapped => {
                self.identity.remove(&(layout.root().to_string(), key));
                Err(err)
            }
            result => result.map(|_| handle),
        }
    }

    /// Handle for `key` without any I/O. The returned entity is loaded on
    /// first access and may turn out not to exist.
    pub fn reference(&mut self, type_name: &str, key: impl Into<EntityKey>) -> Result<EntityHandle> {
        let key = key.into();
        let layout = self.registry.layout(type_name)?;
        let identity_key = (layout.root().to_string(), key.clone());
        if let Some(&handle) = self.identity.get(&identity_key) {
            let instance = self.instance(handle)?;
            let current = instance.layout().name().to_string();
            // Once group 0 of a discriminated row is loaded the type is final.
            let resolved = instance.layout().discriminator().is_some()
                && instance.masks().is_group_loaded(0);
            if current == type_name || self.registry.is_subtype(&current, type_name) {
                return Ok(handle);
            }
            if !resolved && self.registry.is_subtype(type_name, &current) {
                self.instance_mut(handle)?.retype(layout);
                return Ok(handle);
            }
            return Err(DbError::NotFound {
                type_name: type_name.to_string(),
                key: key.to_string(),
            });
        }

        let handle = self.push_instance(layout, EntityState::NonTransactional);
        self.instance_mut(handle)?.assign_key(key)?;
        self.identity.insert(identity_key, handle);
        Ok(handle)
    }

    /// Requests removal of `handle` in the current transaction.
    pub async fn remove(&mut self, handle: EntityHandle) -> Result<()> {
        self.require_transaction()?;
        self.remove_entity(handle).await
    }

    /// Value of a field, loading its group first if needed.
    pub async fn get_field(&mut self, handle: EntityHandle, name: &str) -> Result<FieldValue> {
        let slot = self.instance(handle)?.layout().field(name)?.clone();
        match slot.group {
            Some(group) => self.load_group(handle, group, LoadIntent::Read).await?,
            None => self.load_collection(handle, slot.id).await?,
        }
        Ok(self.instance(handle)?.value(slot.id).clone())
    }

    /// Sets a field, loading its group first and marking it dirty.
    pub async fn set_field(
        &mut self,
        handle: EntityHandle,
        name: &str,
        value: impl Into<FieldValue>,
    ) -> Result<()> {
        let value = value.into();
        let (slot, state, versioned) = {
            let instance = self.instance(handle)?;
            let slot = instance.layout().field(name)?.clone();
            let versioned = instance.layout().version_slot().is_some();
            (slot, instance.state(), versioned)
        };
        if slot.version {
            return Err(DbError::IllegalState(format!(
                "version field '{}' is maintained by the runtime",
                slot.name
            )));
        }
        self.check_value(&slot, &value)?;

        match state {
            EntityState::Deleting | EntityState::Deleted => Err(DbError::IllegalState(format!(
                "cannot modify {} {}: it is {}",
                slot.owner,
                self.instance(handle)?.key_display(),
                state
            ))),
            EntityState::Transient | EntityState::Persisting => {
                self.instance_mut(handle)?.values[slot.id] = value;
                Ok(())
            }
            _ => {
                let Some(group) = slot.group else {
                    return Err(DbError::IllegalState(format!(
                        "'{}' is the inverse side of a relationship; change the owning reference instead",
                        slot.name
                    )));
                };
                self.require_transaction()?;
                self.promote(handle, LoadIntent::Write).await?;
                if versioned {
                    self.load_group(handle, 0, LoadIntent::Write).await?;
                }
                self.load_group(handle, group, LoadIntent::Write).await?;

                let skip = self.config.skip_unchanged_writes;
                let words = self.instance(handle)?.layout().mask_words();
                let instance = self.instance_mut(handle)?;
                if skip && instance.values[slot.id] == value {
                    return Ok(());
                }
                instance.values[slot.id] = value;
                instance.masks.mark_dirty(&GroupMask::single(words, group))?;
                instance.mutated = true;
                Ok(())
            }
        }
    }

    /// Ensures `group` of `handle` is loaded for reading.
    ///
    /// # Panics
    /// Panics if `group` is not a load group of the entity's type.
    pub async fn load(&mut self, handle: EntityHandle, group: usize) -> Result<()> {
        self.load_group(handle, group, LoadIntent::Read).await
    }

    /// Writes pending changes of one entity.
    pub async fn flush(&mut self, handle: EntityHandle) -> Result<()> {
        self.require_transaction()?;
        self.flush_entity(handle).await
    }

    /// Writes pending changes of every enlisted entity: inserts and updates
    /// in enlistment order, then deletes in removal order.
    pub async fn flush_all(&mut self) -> Result<()> {
        self.require_transaction()?;
        let mut next = 0;
        while let Some(handle) = self
            .transaction
            .as_ref()
            .and_then(|tx| tx.enlisted().get(next).copied())
        {
            next += 1;
            let state = self.instance(handle)?.state();
            if matches!(
                state,
                EntityState::Persisting | EntityState::Persisted | EntityState::Transactional
            ) {
                self.flush_entity(handle).await?;
            }
        }

        let removals = self
            .transaction
            .as_ref()
            .map(|tx| tx.removal_order().to_vec())
            .unwrap_or_default();
        for handle in removals {
            if self.instance(handle)?.state() == EntityState::Deleting {
                self.flush_delete(handle).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn entity(&self, handle: EntityHandle) -> Result<&EntityInstance> {
        self.instance(handle)
    }

    pub fn state(&self, handle: EntityHandle) -> Result<EntityState> {
        Ok(self.instance(handle)?.state())
    }

    pub fn key(&self, handle: EntityHandle) -> Result<Option<EntityKey>> {
        Ok(self.instance(handle)?.key().cloned())
    }

    pub fn type_name(&self, handle: EntityHandle) -> Result<String> {
        Ok(self.instance(handle)?.type_name().to_string())
    }

    pub fn version(&self, handle: EntityHandle) -> Result<Option<i64>> {
        Ok(self.instance(handle)?.version())
    }

    pub fn load_mask(&self, handle: EntityHandle) -> Result<GroupMask> {
        Ok(self.instance(handle)?.load_mask().clone())
    }

    pub fn dirty_mask(&self, handle: EntityHandle) -> Result<GroupMask> {
        Ok(self.instance(handle)?.dirty_mask().clone())
    }

    pub fn update_mask(&self, handle: EntityHandle) -> Result<GroupMask> {
        Ok(self.instance(handle)?.update_mask().clone())
    }

    /// Cache item the entity was last synchronised with.
    pub fn cache_item(&self, handle: EntityHandle) -> Result<Option<Arc<CacheItem>>> {
        Ok(self.instance(handle)?.cache_item.clone())
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // ------------------------------------------------------------------
    // Internals shared by the engines
    // ------------------------------------------------------------------

    fn push_instance(
        &mut self,
        layout: Arc<TypeLayout>,
        state: EntityState,
    ) -> EntityHandle {
        let handle = EntityHandle::new(self.id, self.entities.len() as u32);
        self.entities.push(EntityInstance::new(handle, layout, state));
        handle
    }

    fn position(&self, handle: EntityHandle) -> Result<usize> {
        if handle.session() != self.id {
            return Err(DbError::IllegalState(format!(
                "entity {} belongs to another session than {}",
                handle, self.id
            )));
        }
        let index = handle.index();
        if index >= self.entities.len() {
            return Err(DbError::IllegalState(format!("unknown entity handle {}", handle)));
        }
        Ok(index)
    }

    pub(crate) fn instance(&self, handle: EntityHandle) -> Result<&EntityInstance> {
        let index = self.position(handle)?;
        Ok(&self.entities[index])
    }

    pub(crate) fn instance_mut(&mut self, handle: EntityHandle) -> Result<&mut EntityInstance> {
        let index = self.position(handle)?;
        Ok(&mut self.entities[index])
    }

    fn require_transaction(&self) -> Result<&TransactionScope> {
        self.transaction
            .as_ref()
            .filter(|tx| tx.state().is_active())
            .ok_or(DbError::NoActiveTransaction)
    }

    fn scope_mut(&mut self) -> Result<&mut TransactionScope> {
        self.transaction
            .as_mut()
            .filter(|tx| tx.state().is_active())
            .ok_or(DbError::NoActiveTransaction)
    }

    fn current_transaction_id(&self) -> Option<TransactionId> {
        self.transaction
            .as_ref()
            .filter(|tx| tx.state().is_active())
            .map(TransactionScope::id)
    }

    fn register_identity(&mut self, handle: EntityHandle) -> Result<()> {
        let instance = self.instance(handle)?;
        let Some(key) = instance.key().cloned() else {
            return Ok(());
        };
        let identity_key = (instance.layout().root().to_string(), key);
        match self.identity.get(&identity_key) {
            Some(existing) if *existing != handle => Err(DbError::IllegalState(format!(
                "another {} with key {} is already managed by {}",
                identity_key.0, identity_key.1, self.id
            ))),
            _ => {
                self.identity.insert(identity_key, handle);
                Ok(())
            }
        }
    }

    fn unregister_identity(&mut self, handle: EntityHandle) -> Result<()> {
        let instance = self.instance(handle)?;
        if let Some(key) = instance.key().cloned() {
            let identity_key = (instance.layout().root().to_string(), key);
            if self.identity.get(&identity_key) == Some(&handle) {
                self.identity.remove(&identity_key);
            }
        }
        Ok(())
    }

    fn apply(&mut self, handle: EntityHandle, lifecycle: LifecycleEvent) -> Result<()> {
        self.instance_mut(handle)?.apply(lifecycle)
    }

    fn check_value(&self, slot: &SlotLayout, value: &FieldValue) -> Result<()> {
        let mismatch = || {
            DbError::TypeMismatch(format!(
                "field '{}' of {} cannot hold a {} value",
                slot.name,
                slot.owner,
                value.kind_name()
            ))
        };
        match (&slot.kind, value) {
            (SlotKind::Scalar, FieldValue::Scalar(v)) => {
                let column = &slot.columns[0];
                if column.data_type.is_compatible(v) {
                    Ok(())
                } else {
                    Err(DbError::TypeMismatch(format!(
                        "field '{}' expects {}, got {}",
                        slot.name,
                        column.data_type,
                        v.type_name()
                    )))
                }
            }
            (SlotKind::Embedded { .. }, FieldValue::Embedded(values)) => {
                let compatible = values.len() == slot.columns.len()
                    && slot
                        .columns
                        .iter()
                        .zip(values)
                        .all(|(c, v)| c.data_type.is_compatible(v));
                if compatible { Ok(()) } else { Err(mismatch()) }
            }
            (SlotKind::ManyToOne { target }, FieldValue::Ref(reference)) => match reference {
                None => Ok(()),
                Some(other) => {
                    let other_type = self.instance(*other)?.type_name().to_string();
                    if self.registry.is_subtype(&other_type, target) {
                        Ok(())
                    } else {
                        Err(DbError::TypeMismatch(format!(
                            "field '{}' references {}, got {}",
                            slot.name, target, other_type
                        )))
                    }
                }
            },
            (SlotKind::OneToMany { target, .. }, FieldValue::Collection(items)) => {
                for item in items {
                    let item_type = self.instance(*item)?.type_name().to_string();
                    if !self.registry.is_subtype(&item_type, target) {
                        return Err(DbError::TypeMismatch(format!(
                            "collection '{}' holds {}, got {}",
                            slot.name, target, item_type
                        )));
                    }
                }
                Ok(())
            }
            _ => Err(mismatch()),
        }
    }

    fn key_generation(&self, handle: EntityHandle) -> Result<KeyGeneration> {
        Ok(self.instance(handle)?.layout().key_generation())
    }

    // Every statement goes through these three so it is traced once.

    async fn run_query(&mut self, statement: &Statement) -> Result<RowSet> {
        trace_statement(statement);
        self.connection.query(statement).await
    }

    async fn run_execute(&mut self, statement: &Statement) -> Result<u64> {
        trace_statement(statement);
        self.connection.execute(statement).await
    }

    async fn run_insert(
        &mut self,
        statement: &Statement,
        return_generated_keys: bool,
    ) -> Result<InsertOutcome> {
        trace_statement(statement);
        self.connection.insert(statement, return_generated_keys).await
    }
}

fn trace_statement(statement: &Statement) {
    event!(
        target: "memoentity::sql",
        Level::DEBUG,
        sql = statement.sql(),
        bindings = ?statement.bindings(),
        "executing statement"
    );
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("entities", &self.entities.len())
            .field("transaction", &self.transaction)
            .finish()
    }
}
