// ============================================================================
// Statements
// ============================================================================
//
// Every statement the runtime issues is parameterised: SQL text with `?`
// placeholders plus ordinal bindings. The structured shape travels with the
// text so backends that do not parse SQL can still execute it.
//
// ============================================================================

use crate::core::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select => write!(f, "SELECT"),
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// Structure of a statement. Filters are conjunctions of `column = ?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementShape {
    Select {
        table: String,
        columns: Vec<String>,
        filter: Vec<String>,
    },
    Insert {
        table: String,
        columns: Vec<String>,
    },
    Update {
        table: String,
        set: Vec<String>,
        filter: Vec<String>,
    },
    Delete {
        table: String,
        filter: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    shape: StatementShape,
    sql: String,
    bindings: Vec<Value>,
}

impl Statement {
    /// `SELECT c1, c2 FROM t WHERE f1 = ? AND f2 = ?`
    pub fn select(
        table: impl Into<String>,
        columns: Vec<String>,
        filter: Vec<(String, Value)>,
    ) -> Self {
        let (filter, bindings) = split(filter);
        Self::from_shape(
            StatementShape::Select {
                table: table.into(),
                columns,
                filter,
            },
            bindings,
        )
    }

    /// `INSERT INTO t (c1, c2) VALUES (?, ?)`
    pub fn insert(table: impl Into<String>, values: Vec<(String, Value)>) -> Self {
        let (columns, bindings) = split(values);
        Self::from_shape(
            StatementShape::Insert {
                table: table.into(),
                columns,
            },
            bindings,
        )
    }

    /// `UPDATE t SET c1 = ? WHERE f1 = ?`; set bindings precede filter bindings.
    pub fn update(
        table: impl Into<String>,
        set: Vec<(String, Value)>,
        filter: Vec<(String, Value)>,
    ) -> Self {
        let (set, mut bindings) = split(set);
        let (filter, filter_bindings) = split(filter);
        bindings.extend(filter_bindings);
        Self::from_shape(
            StatementShape::Update {
                table: table.into(),
                set,
                filter,
            },
            bindings,
        )
    }

    /// `DELETE FROM t WHERE f1 = ?`
    pub fn delete(table: impl Into<String>, filter: Vec<(String, Value)>) -> Self {
        let (filter, bindings) = split(filter);
        Self::from_shape(
            StatementShape::Delete {
                table: table.into(),
                filter,
            },
            bindings,
        )
    }

    fn from_shape(shape: StatementShape, bindings: Vec<Value>) -> Self {
        let sql = render(&shape);
        Self {
            shape,
            sql,
            bindings,
        }
    }

    pub fn kind(&self) -> StatementKind {
        match self.shape {
            StatementShape::Select { .. } => StatementKind::Select,
            StatementShape::Insert { .. } => StatementKind::Insert,
            StatementShape::Update { .. } => StatementKind::Update,
            StatementShape::Delete { .. } => StatementKind::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match &self.shape {
            StatementShape::Select { table, .. }
            | StatementShape::Insert { table, .. }
            | StatementShape::Update { table, .. }
            | StatementShape::Delete { table, .. } => table,
        }
    }

    pub fn shape(&self) -> &StatementShape {
        &self.shape
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn bindings(&self) -> &[Value] {
        &self.bindings
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

fn split(pairs: Vec<(String, Value)>) -> (Vec<String>, Vec<Value>) {
    pairs.into_iter().unzip()
}

fn render(shape: &StatementShape) -> String {
    match shape {
        StatementShape::Select {
            table,
            columns,
            filter,
        } => format!(
            "SELECT {} FROM {}{}",
            columns.join(", "),
            table,
            where_clause(filter)
        ),
        StatementShape::Insert { table, columns } => format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        ),
        StatementShape::Update { table, set, filter } => format!(
            "UPDATE {} SET {}{}",
            table,
            set.iter()
                .map(|c| format!("{} = ?", c))
                .collect::<Vec<_>>()
                .join(", "),
            where_clause(filter)
        ),
        StatementShape::Delete { table, filter } => {
            format!("DELETE FROM {}{}", table, where_clause(filter))
        }
    }
}

fn where_clause(filter: &[String]) -> String {
    if filter.is_empty() {
        return String::new();
    }
    let predicates: Vec<String> = filter.iter().map(|c| format!("{} = ?", c)).collect();
    format!(" WHERE {}", predicates.join(" AND "))
}
