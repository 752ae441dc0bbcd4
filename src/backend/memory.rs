// ============================================================================
// In-Memory SQL Backend
// ============================================================================
//
// A reference implementation of `SqlConnection`. It executes the structured
// shape of each statement against in-memory tables instead of parsing the
// SQL text. Each connection applies its writes directly and keeps an undo
// log while a transaction is open, so uncommitted writes are visible to
// other connections (read-uncommitted).
//
// ============================================================================

use super::change::Change;
use super::table::{ColumnDef, Table, TableSchema};
use crate::core::{DataType, DbError, EntityKey, Result, Row, Value};
use crate::metadata::{KeyGeneration, TypeRegistry};
use crate::sql::{InsertOutcome, RowSet, SqlConnection, Statement, StatementKind, StatementShape};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{Level, event};

/// One executed statement, as recorded by [`StatementLog`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    pub kind: StatementKind,
    pub table: String,
    pub sql: String,
    pub bindings: Vec<Value>,
}

/// Shared, append-only record of the statements a database executed.
#[derive(Debug, Clone, Default)]
pub struct StatementLog {
    entries: Arc<Mutex<Vec<LoggedStatement>>>,
}

impl StatementLog {
    fn record(&self, statement: &Statement) -> Result<()> {
        self.entries.lock()?.push(LoggedStatement {
            kind: statement.kind(),
            table: statement.table().to_string(),
            sql: statement.sql().to_string(),
            bindings: statement.bindings().to_vec(),
        });
        Ok(())
    }

    pub fn entries(&self) -> Vec<LoggedStatement> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn sql(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.sql).collect()
    }

    pub fn count(&self, kind: StatementKind) -> usize {
        self.entries().iter().filter(|e| e.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<RwLock<HashMap<String, Table>>>,
    log: StatementLog,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table for every storage table the registry maps. Tables
    /// shared by several types receive the union of their columns.
    pub async fn install(&self, registry: &TypeRegistry) -> Result<()> {
        let mut schemas: HashMap<String, TableSchema> = HashMap::new();
        for layout in registry.layouts() {
            let key: Vec<ColumnDef> = layout
                .key_columns()
                .iter()
                .map(|c| ColumnDef {
                    name: c.name.clone(),
                    data_type: c.data_type,
                    nullable: false,
                })
                .collect();
            for (position, table) in layout.tables().iter().enumerate() {
                let schema = schemas.entry(table.name.clone()).or_insert_with(|| {
                    let schema = TableSchema::new(table.name.clone(), key.clone());
                    if position == 0 && layout.key_generation() == KeyGeneration::Identity {
                        schema.with_identity()
                    } else {
                        schema
                    }
                });
                if position == 0 {
                    if let Some(discriminator) = layout.discriminator() {
                        schema.add_column(ColumnDef {
                            name: discriminator.column.clone(),
                            data_type: DataType::Text,
                            nullable: true,
                        });
                    }
                }
                for group in layout.groups_in_table(&table.name) {
                    for column in layout.columns_for(group) {
                        schema.add_column(ColumnDef {
                            name: column.name.clone(),
                            data_type: column.data_type,
                            nullable: column.nullable,
                        });
                    }
                }
            }
        }

        let mut tables = self.tables.write().await;
        for (name, schema) in schemas {
            event!(Level::DEBUG, table = %name, columns = schema.columns().len(), "table installed");
            tables.entry(name).or_insert_with(|| Table::new(schema));
        }
        Ok(())
    }

    pub async fn create_table(&self, schema: TableSchema) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(schema.name()) {
            return Err(DbError::ExecutionError(format!(
                "table '{}' already exists",
                schema.name()
            )));
        }
        tables.insert(schema.name().to_string(), Table::new(schema));
        Ok(())
    }

    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            tables: self.tables.clone(),
            log: self.log.clone(),
            undo: None,
        }
    }

    pub fn log(&self) -> &StatementLog {
        &self.log
    }

    /// Full row image stored under `key`, in table column order.
    pub async fn row(&self, table: &str, key: impl Into<EntityKey>) -> Option<Row> {
        let key = key.into();
        self.tables.read().await.get(table)?.get(&key).cloned()
    }

    /// Value of one column of the row stored under `key`.
    pub async fn column(&self, table: &str, key: impl Into<EntityKey>, column: &str) -> Option<Value> {
        let key = key.into();
        let tables = self.tables.read().await;
        let table = tables.get(table)?;
        let idx = table.schema().find_column_index(column)?;
        table.get(&key).map(|row| row[idx].clone())
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(Table::len)
            .unwrap_or_default()
    }
}

/// One session on a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    tables: Arc<RwLock<HashMap<String, Table>>>,
    log: StatementLog,
    undo: Option<Vec<Change>>,
}

impl MemoryConnection {
    pub fn is_in_transaction(&self) -> bool {
        self.undo.is_some()
    }

    fn record_changes(&mut self, changes: impl IntoIterator<Item = Change>) {
        if let Some(undo) = self.undo.as_mut() {
            undo.extend(changes);
        }
    }

    fn record(&self, statement: &Statement) -> Result<()> {
        self.log.record(statement)
    }
}

fn paired(columns: &[String], bindings: &[Value]) -> Vec<(String, Value)> {
    columns.iter().cloned().zip(bindings.iter().cloned()).collect()
}

fn table_not_found(name: &str) -> DbError {
    DbError::ExecutionError(format!("table '{}' not found", name))
}

fn unexpected(expected: StatementKind, statement: &Statement) -> DbError {
    DbError::ExecutionError(format!(
        "expected a {} statement, got {}",
        expected,
        statement.sql()
    ))
}

#[async_trait]
impl SqlConnection for MemoryConnection {
    async fn query(&mut self, statement: &Statement) -> Result<RowSet> {
        self.record(statement)?;
        let StatementShape::Select {
            table,
            columns,
            filter,
        } = statement.shape()
        else {
            return Err(unexpected(StatementKind::Select, statement));
        };
        let tables = self.tables.read().await;
        let target = tables.get(table).ok_or_else(|| table_not_found(table))?;
        target.select(columns, &paired(filter, statement.bindings()))
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        self.record(statement)?;
        let mut tables = self.tables.write().await;
        let changes: Vec<Change> = match statement.shape() {
            StatementShape::Update { table, set, filter } => {
                let bindings = statement.bindings();
                let (set_values, filter_values) = bindings.split_at(set.len().min(bindings.len()));
                let target = tables.get_mut(table).ok_or_else(|| table_not_found(table))?;
                target
                    .update(&paired(set, set_values), &paired(filter, filter_values))?
                    .into_iter()
                    .map(|(key, old_row)| Change::UpdateRow {
                        table: table.clone(),
                        key,
                        old_row,
                    })
                    .collect()
            }
            StatementShape::Delete { table, filter } => {
                let target = tables.get_mut(table).ok_or_else(|| table_not_found(table))?;
                target
                    .delete(&paired(filter, statement.bindings()))?
                    .into_iter()
                    .map(|(key, old_row)| Change::DeleteRow {
                        table: table.clone(),
                        key,
                        old_row,
                    })
                    .collect()
            }
            _ => return Err(unexpected(StatementKind::Update, statement)),
        };
        drop(tables);

        let affected = changes.len() as u64;
        self.record_changes(changes);
        Ok(affected)
    }

    async fn insert(
        &mut self,
        statement: &Statement,
        return_generated_keys: bool,
    ) -> Result<InsertOutcome> {
        self.record(statement)?;
        let StatementShape::Insert { table, columns } = statement.shape() else {
            return Err(unexpected(StatementKind::Insert, statement));
        };
        let mut tables = self.tables.write().await;
        let target = tables.get_mut(table).ok_or_else(|| table_not_found(table))?;
        let (key, generated) = target.insert(&paired(columns, statement.bindings()))?;
        drop(tables);

        self.record_changes([Change::InsertRow {
            table: table.clone(),
            key,
        }]);
        Ok(InsertOutcome {
            rows_affected: 1,
            generated_key: if return_generated_keys { generated } else { None },
        })
    }

    async fn begin(&mut self) -> Result<()> {
        if self.undo.is_some() {
            return Err(DbError::ExecutionError(
                "transaction already in progress".to_string(),
            ));
        }
        self.undo = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.undo
            .take()
            .map(|_| ())
            .ok_or_else(|| DbError::ExecutionError("no transaction in progress".to_string()))
    }

    async fn rollback(&mut self) -> Result<()> {
        let undo = self
            .undo
            .take()
            .ok_or_else(|| DbError::ExecutionError("no transaction in progress".to_string()))?;
        let mut tables = self.tables.write().await;
        event!(Level::DEBUG, changes = undo.len(), "rolling back connection");
        for change in undo.into_iter().rev() {
            change.undo(&mut *tables);
        }
        Ok(())
    }
}
