// ============================================================================
// Undo Log
// ============================================================================
//
// Writes are applied to the tables immediately; every write inside a
// transaction records the row image needed to reverse it. Rollback replays
// the log newest-first.
//
// ============================================================================

use super::table::Table;
use crate::core::{EntityKey, Row};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum Change {
    InsertRow { table: String, key: EntityKey },
    UpdateRow { table: String, key: EntityKey, old_row: Row },
    DeleteRow { table: String, key: EntityKey, old_row: Row },
}

impl Change {
    pub fn table_name(&self) -> &str {
        match self {
            Change::InsertRow { table, .. }
            | Change::UpdateRow { table, .. }
            | Change::DeleteRow { table, .. } => table,
        }
    }

    /// Reverses this change on `tables`.
    pub(crate) fn undo(self, tables: &mut HashMap<String, Table>) {
        let Some(target) = tables.get_mut(self.table_name()) else {
            return;
        };
        match self {
            Change::InsertRow { key, .. } => target.discard(&key),
            Change::UpdateRow { key, old_row, .. } | Change::DeleteRow { key, old_row, .. } => {
                target.restore(key, old_row)
            }
        }
    }
}
