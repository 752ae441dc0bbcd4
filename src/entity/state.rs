// ============================================================================
// Entity Life Cycle
// ============================================================================
//
// State transitions:
// ```text
// TRANSIENT ──create──> PERSISTING ──insert──> PERSISTED ─┐
//                                                          │ commit / rollback
//       NON_TRANSACTIONAL <──────────────────────────────────┘
//         │        ^
//  promote│        │commit / rollback
//         v        │
//       TRANSACTIONAL ──remove──> DELETING ──delete──> DELETED
// ```
//
// `transition` is the only place that decides legality; callers perform the
// I/O and then apply the event.
//
// ============================================================================

use crate::core::{DbError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Created by the application, not yet known to a transaction.
    Transient,
    /// Registered for insertion; the INSERT has not run yet.
    Persisting,
    /// Inserted by the current transaction.
    Persisted,
    /// Backed by a row, read outside of any transaction.
    NonTransactional,
    /// Backed by a row and enlisted in the current transaction.
    Transactional,
    /// Removal requested; the DELETE has not run yet.
    Deleting,
    /// Row deleted. Loads are no-ops and flushes are errors.
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Create,
    Inserted,
    LoadedOutsideTransaction,
    Promote,
    Remove,
    DeleteFlushed,
    Commit,
    Rollback,
    /// Rollback of a transaction that created the entity: its row never existed.
    Discard,
}

impl EntityState {
    /// States backed (or about to be backed) by a database row.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            Self::Persisted | Self::NonTransactional | Self::Transactional
        )
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted)
    }

    /// Whether field data must come from memory rather than a row.
    pub fn is_unsaved(&self) -> bool {
        matches!(self, Self::Transient | Self::Persisting)
    }

    pub fn transition(self, event: LifecycleEvent) -> Result<EntityState> {
        use EntityState::*;
        use LifecycleEvent::*;

        let next = match (self, event) {
            (Transient, Create) => Persisting,
            (Persisting | Persisted | NonTransactional | Transactional, Create) => self,

            (Persisting, Inserted) => Persisted,

            (Persisted | NonTransactional | Transactional, LoadedOutsideTransaction) => {
                NonTransactional
            }
            (Deleting | Deleted, LoadedOutsideTransaction) => self,

            (NonTransactional | Transactional | Persisted, Promote) => Transactional,

            // Never inserted: nothing to delete, the instance is simply unmanaged again.
            (Persisting, Remove) => Transient,
            (Persisted | NonTransactional | Transactional, Remove) => Deleting,
            (Deleting | Deleted, Remove) => self,

            (Deleting, DeleteFlushed) => Deleted,

            (Persisted | Transactional | NonTransactional, Commit) => NonTransactional,
            (Deleted, Commit) => Deleted,

            (Persisting, Rollback) => Transient,
            (Persisting | Persisted | Transactional | Deleting | Deleted, Discard) => Transient,
            (Persisted | Transactional | NonTransactional | Deleting | Deleted, Rollback) => {
                NonTransactional
            }

            (state, event) => {
                return Err(DbError::IllegalState(format!(
                    "cannot apply {:?} to an entity in state {}",
                    event, state
                )));
            }
        };
        Ok(next)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transient => "TRANSIENT",
            Self::Persisting => "PERSISTING",
            Self::Persisted => "PERSISTED",
            Self::NonTransactional => "NON_TRANSACTIONAL",
            Self::Transactional => "TRANSACTIONAL",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        };
        write!(f, "{}", label)
    }
}
