use crate::core::{DataType, DbError, EntityKey, Result, Row, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnDef>,
    key: Vec<usize>,
    identity: bool,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, key: Vec<ColumnDef>) -> Self {
        let key_len = key.len();
        Self {
            name: name.into(),
            columns: key,
            key: (0..key_len).collect(),
            identity: false,
        }
    }

    /// The single key column is generated on insert when not supplied.
    pub fn with_identity(mut self) -> Self {
        self.identity = self.key.len() == 1;
        self
    }

    /// Adds a column unless one with the same name exists.
    pub fn add_column(&mut self, column: ColumnDef) {
        if self.find_column_index(&column.name).is_none() {
            self.columns.push(column);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.find_column_index(name).ok_or_else(|| {
            DbError::ExecutionError(format!("column '{}' not found in table '{}'", name, self.name))
        })
    }

    fn is_key_column(&self, idx: usize) -> bool {
        self.key.contains(&idx)
    }
}

/// Rows of one table, ordered by primary key.
#[derive(Debug, Clone)]
pub struct Table {
    schema: TableSchema,
    rows: BTreeMap<EntityKey, Row>,
    next_identity: i64,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            next_identity: 1,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Inserts a row built from `(column, value)` pairs; unnamed columns are
    /// NULL. Returns the stored key and the generated key value, if any.
    pub fn insert(&mut self, values: &[(String, Value)]) -> Result<(EntityKey, Option<Value>)> {
        let mut row = vec![Value::Null; self.schema.columns.len()];
        for (column, value) in values {
            let idx = self.schema.column_index(column)?;
            row[idx] = value.clone();
        }

        let mut generated = None;
        if self.schema.identity {
            let idx = self.schema.key[0];
            match &row[idx] {
                Value::Null => {
                    let value = Value::Integer(self.next_identity);
                    self.next_identity += 1;
                    row[idx] = value.clone();
                    generated = Some(value);
                }
                Value::Integer(explicit) => {
                    self.next_identity = self.next_identity.max(explicit + 1);
                }
                _ => {}
            }
        }

        self.validate_row(&row)?;
        let key = self.key_of(&row);
        if self.rows.contains_key(&key) {
            return Err(DbError::ConstraintViolation(format!(
                "duplicate primary key {} in table '{}'",
                key, self.schema.name
            )));
        }
        self.rows.insert(key.clone(), row);
        Ok((key, generated))
    }

    /// Keys of rows matching every `column = value` predicate.
    pub fn matching(&self, filter: &[(String, Value)]) -> Result<Vec<EntityKey>> {
        let predicates = filter
            .iter()
            .map(|(column, value)| Ok((self.schema.column_index(column)?, value)))
            .collect::<Result<Vec<_>>>()?;
        Ok(self
            .rows
            .iter()
            .filter(|(_, row)| predicates.iter().all(|(idx, value)| &row[*idx] == *value))
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// Projects `columns` of the rows matching `filter`.
    pub fn select(&self, columns: &[String], filter: &[(String, Value)]) -> Result<Vec<Row>> {
        let indices = columns
            .iter()
            .map(|c| self.schema.column_index(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(self
            .matching(filter)?
            .iter()
            .filter_map(|key| self.rows.get(key))
            .map(|row| indices.iter().map(|idx| row[*idx].clone()).collect())
            .collect())
    }

    /// Applies `set` to the matching rows and returns their previous images.
    pub fn update(
        &mut self,
        set: &[(String, Value)],
        filter: &[(String, Value)],
    ) -> Result<Vec<(EntityKey, Row)>> {
        let assignments = set
            .iter()
            .map(|(column, value)| {
                let idx = self.schema.column_index(column)?;
                if self.schema.is_key_column(idx) {
                    return Err(DbError::ExecutionError(format!(
                        "primary key column '{}' cannot be updated",
                        column
                    )));
                }
                Ok((idx, value.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut previous = Vec::new();
        for key in self.matching(filter)? {
            let Some(row) = self.rows.get(&key) else {
                continue;
            };
            let mut new_row = row.clone();
            for (idx, value) in &assignments {
                new_row[*idx] = value.clone();
            }
            self.validate_row(&new_row)?;
            if let Some(old) = self.rows.insert(key.clone(), new_row) {
                previous.push((key, old));
            }
        }
        Ok(previous)
    }

    /// Deletes the matching rows and returns them.
    pub fn delete(&mut self, filter: &[(String, Value)]) -> Result<Vec<(EntityKey, Row)>> {
        let mut removed = Vec::new();
        for key in self.matching(filter)? {
            if let Some(row) = self.rows.remove(&key) {
                removed.push((key, row));
            }
        }
        Ok(removed)
    }

    pub(crate) fn restore(&mut self, key: EntityKey, row: Row) {
        self.rows.insert(key, row);
    }

    pub(crate) fn discard(&mut self, key: &EntityKey) {
        self.rows.remove(key);
    }

    fn key_of(&self, row: &Row) -> EntityKey {
        EntityKey::new(self.schema.key.iter().map(|idx| row[*idx].clone()).collect())
    }

    fn validate_row(&self, row: &Row) -> Result<()> {
        for (column, value) in self.schema.columns.iter().zip(row) {
            if value.is_null() && !column.nullable {
                return Err(DbError::ConstraintViolation(format!(
                    "column '{}.{}' cannot be NULL",
                    self.schema.name, column.name
                )));
            }
            if !column.data_type.is_compatible(value) {
                return Err(DbError::TypeMismatch(format!(
                    "column '{}.{}' expects {}, got {}",
                    self.schema.name,
                    column.name,
                    column.data_type,
                    value.type_name()
                )));
            }
        }
        Ok(())
    }
}
