use super::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub type Row = Vec<Value>;

/// Primary key of an entity: one value per key column, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(Vec<Value>);

impl EntityKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }

    /// The key as a single column value. Relationship columns only reference
    /// single-column keys, so this is how a key travels through a foreign key.
    pub fn as_column_value(&self) -> Option<&Value> {
        match self.0.as_slice() {
            [single] => Some(single),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{}", single),
            values => {
                write!(f, "(")?;
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<i64> for EntityKey {
    fn from(value: i64) -> Self {
        Self::single(value)
    }
}

impl From<i32> for EntityKey {
    fn from(value: i32) -> Self {
        Self::single(value)
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self::single(value)
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one session; handles remember the session that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Reference to an entity instance owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle {
    session: SessionId,
    index: u32,
}

impl EntityHandle {
    pub(crate) fn new(session: SessionId, index: u32) -> Self {
        Self { session, index }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.index)
    }
}
