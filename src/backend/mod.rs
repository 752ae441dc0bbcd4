pub mod change;
pub mod memory;
pub mod table;

pub use change::Change;
pub use memory::{LoggedStatement, MemoryConnection, MemoryDatabase, StatementLog};
pub use table::{ColumnDef, Table, TableSchema};
