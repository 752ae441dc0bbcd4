use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("{type_name} with key {key} not found")]
    NotFound { type_name: String, key: String },

    #[error("Optimistic lock conflict on {type_name} {key}: version {version} is stale")]
    OptimisticLock {
        type_name: String,
        key: String,
        version: i64,
    },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Type '{0}' is not registered")]
    UnknownType(String),

    #[error("Field '{field}' not found on type '{type_name}'")]
    UnknownField { type_name: String, field: String },

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. })
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
