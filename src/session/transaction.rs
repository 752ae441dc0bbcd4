// ============================================================================
// Transaction Scope
// ============================================================================
//
// State of one session transaction:
// ```text
// Active ──commit──> Committed
//   │
//   └──rollback──> Aborted
// ```
// The scope remembers which entities joined the transaction (in order), the
// order removals were requested in, the cascade walk's visited set, and the
// hooks to run once the outcome is known.
//
// ============================================================================

use super::cascade::CascadeOp;
use crate::core::{DbError, EntityHandle, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Callback run after a transaction ends.
pub type TransactionHook = Box<dyn FnOnce() + Send + Sync>;

pub struct TransactionScope {
    id: TransactionId,
    state: TransactionState,
    enlisted: Vec<EntityHandle>,
    members: HashSet<EntityHandle>,
    removal_order: Vec<EntityHandle>,
    visited: HashSet<(EntityHandle, CascadeOp)>,
    commit_hooks: Vec<TransactionHook>,
    rollback_hooks: Vec<TransactionHook>,
    start_time: Instant,
}

impl TransactionScope {
    pub fn new() -> Self {
        Self {
            id: TransactionId::new(),
            state: TransactionState::Active,
            enlisted: Vec::new(),
            members: HashSet::new(),
            removal_order: Vec::new(),
            visited: HashSet::new(),
            commit_hooks: Vec::new(),
            rollback_hooks: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Adds `handle` to the transaction; returns false if it already joined.
    pub fn enlist(&mut self, handle: EntityHandle) -> bool {
        if !self.members.insert(handle) {
            return false;
        }
        self.enlisted.push(handle);
        true
    }

    pub fn is_enlisted(&self, handle: EntityHandle) -> bool {
        self.members.contains(&handle)
    }

    /// Entities in the order they joined.
    pub fn enlisted(&self) -> &[EntityHandle] {
        &self.enlisted
    }

    pub fn schedule_removal(&mut self, handle: EntityHandle) {
        self.enlist(handle);
        if !self.removal_order.contains(&handle) {
            self.removal_order.push(handle);
        }
    }

    pub fn removal_order(&self) -> &[EntityHandle] {
        &self.removal_order
    }

    /// Records a cascade visit; returns false when `(handle, op)` was
    /// already visited in this transaction.
    pub fn visit(&mut self, handle: EntityHandle, op: CascadeOp) -> bool {
        self.visited.insert((handle, op))
    }

    /// Drops `handle` from the transaction, including its cascade visits.
    /// Used when an entity goes back to TRANSIENT before it was ever written.
    pub fn forget(&mut self, handle: EntityHandle) {
        if self.members.remove(&handle) {
            self.enlisted.retain(|&h| h != handle);
        }
        self.removal_order.retain(|&h| h != handle);
        self.visited.retain(|&(h, _)| h != handle);
    }

    pub fn on_commit(&mut self, hook: TransactionHook) {
        self.commit_hooks.push(hook);
    }

    pub fn on_rollback(&mut self, hook: TransactionHook) {
        self.rollback_hooks.push(hook);
    }

    /// Marks the scope committed and hands back the commit hooks.
    pub fn commit(&mut self) -> Result<Vec<TransactionHook>> {
        if !self.state.is_active() {
            return Err(DbError::IllegalState(format!(
                "cannot commit: transaction {} is already {}",
                self.id, self.state
            )));
        }
        self.state = TransactionState::Committed;
        self.rollback_hooks.clear();
        Ok(std::mem::take(&mut self.commit_hooks))
    }

    /// Marks the scope aborted and hands back the rollback hooks.
    pub fn rollback(&mut self) -> Result<Vec<TransactionHook>> {
        if !self.state.is_active() {
            return Err(DbError::IllegalState(format!(
                "cannot rollback: transaction {} is already {}",
                self.id, self.state
            )));
        }
        self.state = TransactionState::Aborted;
        self.commit_hooks.clear();
        Ok(std::mem::take(&mut self.rollback_hooks))
    }
}

impl Default for TransactionScope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("enlisted", &self.enlisted.len())
            .field("removals", &self.removal_order.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionId;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn handle(index: u32) -> EntityHandle {
        EntityHandle::new(SessionId::new(), index)
    }

    #[test]
    fn test_transaction_id_generation() {
        let id1 = TransactionId::new();
        let id2 = TransactionId::new();
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_enlist_keeps_first_order() {
        let mut scope = TransactionScope::new();
        let (a, b) = (handle(0), handle(1));
        assert!(scope.enlist(a));
        assert!(scope.enlist(b));
        assert!(!scope.enlist(a));
        scope.schedule_removal(b);
        scope.schedule_removal(b);
        assert_eq!(scope.enlisted(), &[a, b]);
        assert_eq!(scope.removal_order(), &[b]);
    }

    #[test]
    fn test_visited_set_is_per_operation() {
        let mut scope = TransactionScope::new();
        let a = handle(0);
        assert!(scope.visit(a, CascadeOp::Persist));
        assert!(!scope.visit(a, CascadeOp::Persist));
        assert!(scope.visit(a, CascadeOp::Remove));
    }

    #[test]
    fn test_forget_clears_membership_and_visits() {
        let mut scope = TransactionScope::new();
        let (a, b) = (handle(0), handle(1));
        scope.enlist(a);
        scope.enlist(b);
        scope.visit(a, CascadeOp::Persist);
        scope.visit(a, CascadeOp::Remove);
        scope.forget(a);
        assert_eq!(scope.enlisted(), &[b]);
        assert!(!scope.is_enlisted(a));
        assert!(scope.visit(a, CascadeOp::Persist));
        assert!(scope.enlist(a));
        assert_eq!(scope.enlisted(), &[b, a]);
    }

    #[test]
    fn test_commit_returns_commit_hooks_only() {
        let committed = Arc::new(AtomicBool::new(false));
        let rolled_back = Arc::new(AtomicBool::new(false));
        let mut scope = TransactionScope::new();
        let flag = committed.clone();
        scope.on_commit(Box::new(move || flag.store(true, Ordering::SeqCst)));
        let flag = rolled_back.clone();
        scope.on_rollback(Box::new(move || flag.store(true, Ordering::SeqCst)));

        for hook in scope.commit().unwrap() {
            hook();
        }
        assert!(committed.load(Ordering::SeqCst));
        assert!(!rolled_back.load(Ordering::SeqCst));
        assert!(scope.state().is_terminal());
        assert!(scope.commit().is_err());
        assert!(scope.rollback().is_err());
    }
}
