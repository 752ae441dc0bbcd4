use crate::core::Result;
use serde::Deserialize;

/// Runtime configuration shared by every session of a [`crate::PersistenceRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Whether committed entity state is shared through the entity cache.
    pub cache_enabled: bool,

    /// Maximum number of cache items kept; least recently used items go first.
    pub cache_capacity: usize,

    /// Version written by the first INSERT of a versioned entity.
    pub initial_version: i64,

    /// Re-read every previously loaded group when an entity is first
    /// modified in a transaction, instead of only the groups it touches.
    pub reload_on_promotion: bool,

    /// Setting a field to the value it already holds leaves it clean.
    pub skip_unchanged_writes: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_capacity: 10_000,
            initial_version: 1,
            reload_on_promotion: true,
            skip_unchanged_writes: true,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON object; absent keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn initial_version(mut self, version: i64) -> Self {
        self.initial_version = version;
        self
    }

    pub fn reload_on_promotion(mut self, reload: bool) -> Self {
        self.reload_on_promotion = reload;
        self
    }

    pub fn skip_unchanged_writes(mut self, skip: bool) -> Self {
        self.skip_unchanged_writes = skip;
        self
    }
}
