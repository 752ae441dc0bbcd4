pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, Result};
pub use types::{EntityHandle, EntityKey, Row, SessionId};
pub use value::{DataType, FieldValue, Value};
