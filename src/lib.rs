// ============================================================================
// memoentity Library
// ============================================================================
//
// Entity persistence runtime: entities are loaded in load groups, changes are
// tracked per group with bitmasks, flushed as minimal INSERT/UPDATE/DELETE
// statements with optimistic version checks, and committed state is shared
// between sessions through an immutable-item cache.
//
// ============================================================================

pub mod backend;
pub mod cache;
pub mod config;
pub mod core;
pub mod entity;
pub mod metadata;
pub mod runtime;
pub mod session;
pub mod sql;

// Re-export main types for convenience
pub use backend::{MemoryConnection, MemoryDatabase, StatementLog};
pub use cache::{CacheItem, CacheKey, CacheStats, EntityCache};
pub use config::RuntimeConfig;
pub use crate::core::{DataType, DbError, EntityHandle, EntityKey, FieldValue, Result, Value};
pub use entity::{EntityState, GroupMask};
pub use metadata::{Callback, CascadeSet, EntityListener, KeyGeneration, TypeRegistry};
pub use runtime::PersistenceRuntime;
pub use session::{Session, TransactionContext, TransactionId};
pub use sql::{SqlConnection, Statement, StatementKind};
