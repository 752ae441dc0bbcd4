// ============================================================================
// Transaction Context
// ============================================================================
//
// begin / commit / rollback for a session, and the hook registration surface
// other components use to learn about the outcome.
//
// Commit:   flush_all -> connection commit -> publish written entities, evict
//           deleted ones -> entities become NON_TRANSACTIONAL -> commit hooks
// Rollback: connection rollback -> entities created in the transaction become
//           TRANSIENT, the rest NON_TRANSACTIONAL with nothing loaded ->
//           cache items of written entities evicted -> rollback hooks
//
// ============================================================================

use super::transaction::{TransactionHook, TransactionId, TransactionScope};
use super::Session;
use crate::core::{DbError, EntityHandle, Result};
use crate::entity::{EntityState, LifecycleEvent};
use crate::metadata::KeyGeneration;
use tracing::{Instrument, Level, event, info_span};

/// What a participant in a session transaction can observe and hook into.
pub trait TransactionContext {
    fn is_in_transaction(&self) -> bool;

    fn current_transaction(&self) -> Option<TransactionId>;

    /// Runs `hook` after the current transaction commits.
    fn on_commit(&mut self, hook: TransactionHook) -> Result<()>;

    /// Runs `hook` after the current transaction rolls back.
    fn on_rollback(&mut self, hook: TransactionHook) -> Result<()>;
}

impl TransactionContext for Session {
    fn is_in_transaction(&self) -> bool {
        self.current_transaction_id().is_some()
    }

    fn current_transaction(&self) -> Option<TransactionId> {
        self.current_transaction_id()
    }

    fn on_commit(&mut self, hook: TransactionHook) -> Result<()> {
        self.scope_mut()?.on_commit(hook);
        Ok(())
    }

    fn on_rollback(&mut self, hook: TransactionHook) -> Result<()> {
        self.scope_mut()?.on_rollback(hook);
        Ok(())
    }
}

impl Session {
    pub async fn begin(&mut self) -> Result<TransactionId> {
        if let Some(active) = self.current_transaction_id() {
            return Err(DbError::IllegalState(format!(
                "session {} already has transaction {} open",
                self.id, active
            )));
        }
        self.connection.begin().await?;
        let scope = TransactionScope::new();
        let id = scope.id();
        self.transaction = Some(scope);
        event!(Level::DEBUG, session = %self.id, transaction = %id, "transaction started");
        Ok(id)
    }

    pub async fn commit(&mut self) -> Result<()> {
        let tx_id = self.require_transaction()?.id();
        let span = info_span!("commit", session = %self.id, transaction = %tx_id);
        self.commit_inner().instrument(span).await
    }

    /// Rolls back the open transaction. Cleanup runs even when the
    /// connection's rollback fails; that error is returned afterwards.
    pub async fn rollback(&mut self) -> Result<()> {
        let tx_id = self.require_transaction()?.id();
        let span = info_span!("rollback", session = %self.id, transaction = %tx_id);
        self.rollback_inner().instrument(span).await
    }

    async fn commit_inner(&mut self) -> Result<()> {
        self.flush_all().await?;
        self.connection.commit().await?;

        let enlisted = self.enlisted_handles();
        for &handle in &enlisted {
            let (state, written) = {
                let instance = self.instance(handle)?;
                (instance.state(), instance.mutated || instance.created_in_transaction)
            };
            match state {
                EntityState::Transient => {}
                EntityState::Deleted => self.evict_cached(handle)?,
                _ => {
                    // Only writers publish; a reader's view may already be
                    // older than the item another session committed.
                    if written {
                        self.sync_to_cache(handle)?;
                    }
                    self.apply(handle, LifecycleEvent::Commit)?;
                }
            }
            self.release(handle)?;
        }

        let hooks = self.scope_mut()?.commit()?;
        self.transaction = None;
        self.inserting.clear();
        event!(Level::INFO, entities = enlisted.len(), "transaction committed");
        for hook in hooks {
            hook();
        }
        Ok(())
    }

    async fn rollback_inner(&mut self) -> Result<()> {
        let outcome = self.connection.rollback().await;
        if let Err(err) = &outcome {
            event!(Level::WARN, error = %err, "connection rollback failed");
        }

        let enlisted = self.enlisted_handles();
        for &handle in &enlisted {
            let (state, created, mutated) = {
                let instance = self.instance(handle)?;
                (instance.state(), instance.created_in_transaction, instance.mutated)
            };
            if mutated {
                self.evict_cached(handle)?;
            }
            if state == EntityState::Transient {
                self.release(handle)?;
                continue;
            }
            if created {
                self.unregister_identity(handle)?;
                let identity = self.key_generation(handle)? == KeyGeneration::Identity;
                let instance = self.instance_mut(handle)?;
                instance.apply(LifecycleEvent::Discard)?;
                instance.masks.reset();
                instance.loaded_collections.clear();
                instance.cache_item = None;
                if identity {
                    instance.key = None;
                }
            } else {
                let instance = self.instance_mut(handle)?;
                instance.apply(LifecycleEvent::Rollback)?;
                instance.invalidate();
            }
            self.release(handle)?;
        }

        let hooks = self.scope_mut()?.rollback()?;
        self.transaction = None;
        self.inserting.clear();
        event!(Level::INFO, entities = enlisted.len(), "transaction rolled back");
        for hook in hooks {
            hook();
        }
        outcome
    }

    fn enlisted_handles(&self) -> Vec<EntityHandle> {
        self.transaction
            .as_ref()
            .map(|tx| tx.enlisted().to_vec())
            .unwrap_or_default()
    }

    fn release(&mut self, handle: EntityHandle) -> Result<()> {
        let instance = self.instance_mut(handle)?;
        instance.transaction = None;
        instance.created_in_transaction = false;
        instance.mutated = false;
        Ok(())
    }
}
