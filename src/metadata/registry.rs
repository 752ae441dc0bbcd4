use super::descriptor::{TypeDescriptor, TypeKind};
use super::layout::{SlotKind, TypeLayout};
use super::listener::EntityListener;
use crate::core::{DbError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event};

/// Collects descriptors and listener implementations before freezing them
/// into a [`TypeRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: Vec<TypeDescriptor>,
    listeners: HashMap<String, Arc<dyn EntityListener>>,
}

impl RegistryBuilder {
    pub fn register(mut self, descriptor: TypeDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Registers every descriptor in a JSON array.
    pub fn register_json(mut self, json: &str) -> Result<Self> {
        let descriptors: Vec<TypeDescriptor> = serde_json::from_str(json)?;
        self.descriptors.extend(descriptors);
        Ok(self)
    }

    pub fn bind_listener(mut self, name: impl Into<String>, listener: Arc<dyn EntityListener>) -> Self {
        self.listeners.insert(name.into(), listener);
        self
    }

    pub fn build(self) -> Result<TypeRegistry> {
        let mut descriptors: HashMap<String, TypeDescriptor> = HashMap::new();
        for desc in self.descriptors {
            if descriptors.contains_key(&desc.name) {
                return Err(DbError::InvalidDescriptor(format!(
                    "type '{}' registered twice",
                    desc.name
                )));
            }
            descriptors.insert(desc.name.clone(), desc);
        }

        let mut layouts: HashMap<String, Arc<TypeLayout>> = HashMap::new();
        for desc in descriptors.values().filter(|d| d.is_entity()) {
            let layout = TypeLayout::build(&descriptors, &desc.name)?;
            layouts.insert(desc.name.clone(), Arc::new(layout));
        }

        let mut discriminators: HashMap<String, HashMap<String, String>> = HashMap::new();
        for layout in layouts.values() {
            let Some(value) = layout.discriminator().and_then(|d| d.value.clone()) else {
                continue;
            };
            let by_value = discriminators.entry(layout.root().to_string()).or_default();
            if let Some(existing) = by_value.insert(value.clone(), layout.name().to_string()) {
                return Err(DbError::InvalidDescriptor(format!(
                    "discriminator value '{}' used by both '{}' and '{}'",
                    value,
                    existing,
                    layout.name()
                )));
            }
        }

        for desc in descriptors.values() {
            if let TypeKind::Listener { .. } = desc.kind {
                if !self.listeners.contains_key(&desc.name) {
                    event!(Level::WARN, listener = %desc.name, "listener declared without an implementation");
                }
            }
        }

        let registry = TypeRegistry {
            descriptors,
            layouts,
            discriminators,
            listeners: self.listeners,
        };
        registry.validate_inverse_relations()?;
        Ok(registry)
    }
}

/// Read-only mapping metadata for one application: descriptors, the layouts
/// derived from them and the bound listener implementations.
pub struct TypeRegistry {
    descriptors: HashMap<String, TypeDescriptor>,
    layouts: HashMap<String, Arc<TypeLayout>>,
    discriminators: HashMap<String, HashMap<String, String>>,
    listeners: HashMap<String, Arc<dyn EntityListener>>,
}

impl TypeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn lookup(&self, name: &str) -> Result<&TypeDescriptor> {
        self.descriptors
            .get(name)
            .ok_or_else(|| DbError::UnknownType(name.to_string()))
    }

    pub fn layout(&self, name: &str) -> Result<Arc<TypeLayout>> {
        self.layouts
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::UnknownType(name.to_string()))
    }

    /// Entity layouts, sorted by name.
    pub fn layouts(&self) -> Vec<Arc<TypeLayout>> {
        let mut layouts: Vec<Arc<TypeLayout>> = self.layouts.values().cloned().collect();
        layouts.sort_by(|a, b| a.name().cmp(b.name()));
        layouts
    }

    /// Concrete type stored under `value` in the hierarchy rooted at `root`.
    pub fn resolve_discriminator(&self, root: &str, value: &str) -> Result<Arc<TypeLayout>> {
        let name = self
            .discriminators
            .get(root)
            .and_then(|by_value| by_value.get(value))
            .ok_or_else(|| {
                DbError::TypeMismatch(format!(
                    "discriminator value '{}' is not mapped under '{}'",
                    value, root
                ))
            })?;
        self.layout(name)
    }

    /// Whether `sub` is `sup` or inherits from it.
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        self.layouts
            .get(sub)
            .map(|layout| layout.chain().iter().any(|n| n == sup))
            .unwrap_or(false)
    }

    pub fn listener(&self, name: &str) -> Option<&Arc<dyn EntityListener>> {
        self.listeners.get(name)
    }

    fn validate_inverse_relations(&self) -> Result<()> {
        for layout in self.layouts.values() {
            for slot in layout.relation_slots() {
                let SlotKind::OneToMany { target, mapped_by } = &slot.kind else {
                    continue;
                };
                let target_layout = self.layout(target)?;
                let owner = target_layout.field(mapped_by).map_err(|_| {
                    DbError::InvalidDescriptor(format!(
                        "'{}.{}' is mapped by '{}.{}', which does not exist",
                        layout.name(),
                        slot.name,
                        target,
                        mapped_by
                    ))
                })?;
                let points_back = match &owner.kind {
                    SlotKind::ManyToOne { target: back } => self.is_subtype(layout.name(), back),
                    _ => false,
                };
                if !points_back {
                    return Err(DbError::InvalidDescriptor(format!(
                        "'{}.{}' must be a many-to-one back to '{}'",
                        target,
                        mapped_by,
                        layout.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.descriptors.len())
            .field("entities", &self.layouts.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::metadata::descriptor::{FieldDescriptor, RelationDescriptor};

    fn shapes() -> RegistryBuilder {
        TypeRegistry::builder()
            .register(
                TypeDescriptor::entity("Shape", "shapes")
                    .key(FieldDescriptor::new("id", DataType::Integer))
                    .discriminator("kind")
                    .discriminator_value("shape"),
            )
            .register(
                TypeDescriptor::entity("Circle", "circles")
                    .parent("Shape")
                    .discriminator_value("circle")
                    .field(FieldDescriptor::new("radius", DataType::Float)),
            )
    }

    #[test]
    fn test_resolve_discriminator() {
        let registry = shapes().build().unwrap();
        let layout = registry.resolve_discriminator("Shape", "circle").unwrap();
        assert_eq!(layout.name(), "Circle");
        assert!(registry.is_subtype("Circle", "Shape"));
        assert!(!registry.is_subtype("Shape", "Circle"));
        assert!(registry.resolve_discriminator("Shape", "square").is_err());
    }

    #[test]
    fn test_duplicate_discriminator_rejected() {
        let result = shapes()
            .register(
                TypeDescriptor::entity("Disc", "discs")
                    .parent("Shape")
                    .discriminator_value("circle"),
            )
            .build();
        assert!(matches!(result, Err(DbError::InvalidDescriptor(_))));
    }

    #[test]
    fn test_inverse_relation_must_point_back() {
        let result = TypeRegistry::builder()
            .register(
                TypeDescriptor::entity("Team", "teams")
                    .key(FieldDescriptor::new("id", DataType::Integer))
                    .relation(RelationDescriptor::one_to_many("players", "Player", "name")),
            )
            .register(
                TypeDescriptor::entity("Player", "players")
                    .key(FieldDescriptor::new("id", DataType::Integer))
                    .field(FieldDescriptor::new("name", DataType::Text)),
            )
            .build();
        assert!(matches!(result, Err(DbError::InvalidDescriptor(_))));
    }

    #[test]
    fn test_register_json() {
        let registry = TypeRegistry::builder()
            .register_json(
                r#"[{
                    "name": "Tag",
                    "kind": { "kind": "entity", "table": "tags" },
                    "key": [{ "name": "id", "column": "id", "data_type": "text" }]
                }]"#,
            )
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(registry.lookup("Tag").unwrap().table(), Some("tags"));
        assert!(matches!(registry.layout("Nope"), Err(DbError::UnknownType(_))));
    }
}
