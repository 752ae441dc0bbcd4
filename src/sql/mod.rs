pub mod connection;
pub mod statement;

pub use connection::{InsertOutcome, RowSet, SqlConnection};
pub use statement::{Statement, StatementKind, StatementShape};
