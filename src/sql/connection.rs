use super::Statement;
use crate::core::{Result, Row, Value};
use async_trait::async_trait;

pub type RowSet = Vec<Row>;

/// Result of an INSERT.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub rows_affected: u64,
    /// Key generated by the database, when requested and produced.
    pub generated_key: Option<Value>,
}

/// The statement-execution collaborator a session runs on.
///
/// Implementations own one database session; errors (including constraint
/// violations) are returned unchanged to the runtime, which does not
/// reinterpret them.
#[async_trait]
pub trait SqlConnection: Send + Sync {
    async fn query(&mut self, statement: &Statement) -> Result<RowSet>;

    /// Executes an UPDATE or DELETE and returns the affected row count.
    async fn execute(&mut self, statement: &Statement) -> Result<u64>;

    async fn insert(
        &mut self,
        statement: &Statement,
        return_generated_keys: bool,
    ) -> Result<InsertOutcome>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
