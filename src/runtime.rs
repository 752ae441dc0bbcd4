use crate::cache::EntityCache;
use crate::config::RuntimeConfig;
use crate::metadata::TypeRegistry;
use crate::session::Session;
use crate::sql::SqlConnection;
use std::sync::Arc;
use tracing::{Level, event};

/// Process-wide half of the runtime: the frozen type registry, the shared
/// entity cache and the configuration every session starts from.
///
/// Sessions are cheap; open one per unit of work.
///
/// # Examples
///
/// ```
/// use memoentity::{MemoryDatabase, PersistenceRuntime, RuntimeConfig, TypeRegistry};
/// use memoentity::metadata::{FieldDescriptor, TypeDescriptor};
/// use memoentity::DataType;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> memoentity::Result<()> {
/// let registry = TypeRegistry::builder()
///     .register(
///         TypeDescriptor::entity("Account", "accounts")
///             .key(FieldDescriptor::new("id", DataType::Integer))
///             .field(FieldDescriptor::new("owner", DataType::Text)),
///     )
///     .build()?;
/// let registry = Arc::new(registry);
///
/// let database = MemoryDatabase::new();
/// database.install(&registry).await?;
/// let runtime = PersistenceRuntime::new(registry, RuntimeConfig::default());
///
/// let mut session = runtime.open_session(Box::new(database.connect()));
/// session.begin().await?;
/// let account = session.new_entity("Account")?;
/// session.set_key(account, 1)?;
/// session.set_field(account, "owner", "ada").await?;
/// session.create(account).await?;
/// session.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PersistenceRuntime {
    registry: Arc<TypeRegistry>,
    cache: Option<Arc<EntityCache>>,
    config: RuntimeConfig,
}

impl PersistenceRuntime {
    pub fn new(registry: Arc<TypeRegistry>, config: RuntimeConfig) -> Self {
        let cache = config
            .cache_enabled
            .then(|| Arc::new(EntityCache::new(config.cache_capacity)));
        event!(
            Level::DEBUG,
            types = registry.layouts().len(),
            cache = config.cache_enabled,
            capacity = config.cache_capacity,
            "persistence runtime created"
        );
        Self {
            registry,
            cache,
            config,
        }
    }

    pub fn open_session(&self, connection: Box<dyn SqlConnection>) -> Session {
        Session::new(
            self.registry.clone(),
            self.cache.clone(),
            self.config.clone(),
            connection,
        )
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// The shared cache, or `None` when caching is disabled.
    pub fn cache(&self) -> Option<&Arc<EntityCache>> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}
