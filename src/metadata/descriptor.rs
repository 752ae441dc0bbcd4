// ============================================================================
// Type Descriptors
// ============================================================================
//
// Read-only mapping metadata for one type. Descriptors are plain data and can
// be loaded from JSON; the registry validates them and derives the layouts the
// runtime works with.
//
// ============================================================================

use crate::core::DataType;
use serde::{Deserialize, Serialize};

/// Describes one mapped type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    #[serde(default)]
    pub parent: Option<String>,
    /// Primary-key fields, declared on the persistable root of a hierarchy.
    #[serde(default)]
    pub key: Vec<FieldDescriptor>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub relations: Vec<RelationDescriptor>,
    /// Discriminator column, declared on the root of a polymorphic hierarchy.
    #[serde(default)]
    pub discriminator: Option<String>,
    /// Name of the integer field used for optimistic locking.
    #[serde(default)]
    pub version: Option<String>,
    /// Names of `Listener` descriptors whose callbacks apply to this type.
    #[serde(default)]
    pub listeners: Vec<String>,
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
}

fn default_cacheable() -> bool {
    true
}

impl TypeDescriptor {
    pub fn entity(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            TypeKind::Entity {
                table: table.into(),
                key_generation: KeyGeneration::Assigned,
                discriminator_value: None,
            },
        )
    }

    pub fn mapped_superclass(name: impl Into<String>) -> Self {
        Self::with_kind(name, TypeKind::MappedSuperclass)
    }

    pub fn embeddable(name: impl Into<String>) -> Self {
        Self::with_kind(name, TypeKind::Embeddable)
    }

    pub fn listener(name: impl Into<String>, callbacks: Vec<Callback>) -> Self {
        Self::with_kind(name, TypeKind::Listener { callbacks })
    }

    fn with_kind(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parent: None,
            key: Vec::new(),
            fields: Vec::new(),
            relations: Vec::new(),
            discriminator: None,
            version: None,
            listeners: Vec::new(),
            cacheable: true,
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn key(mut self, field: FieldDescriptor) -> Self {
        self.key.push(field);
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn discriminator(mut self, column: impl Into<String>) -> Self {
        self.discriminator = Some(column.into());
        self
    }

    pub fn discriminator_value(mut self, value: impl Into<String>) -> Self {
        if let TypeKind::Entity {
            discriminator_value,
            ..
        } = &mut self.kind
        {
            *discriminator_value = Some(value.into());
        }
        self
    }

    pub fn identity(mut self) -> Self {
        if let TypeKind::Entity { key_generation, .. } = &mut self.kind {
            *key_generation = KeyGeneration::Identity;
        }
        self
    }

    pub fn version(mut self, field: impl Into<String>) -> Self {
        self.version = Some(field.into());
        self
    }

    pub fn listen(mut self, listener: impl Into<String>) -> Self {
        self.listeners.push(listener.into());
        self
    }

    pub fn not_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn table(&self) -> Option<&str> {
        match &self.kind {
            TypeKind::Entity { table, .. } => Some(table),
            _ => None,
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self.kind, TypeKind::Entity { .. })
    }
}

/// The role a type plays in the mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeKind {
    Entity {
        table: String,
        #[serde(default)]
        key_generation: KeyGeneration,
        #[serde(default)]
        discriminator_value: Option<String>,
    },
    MappedSuperclass,
    Embeddable,
    Listener {
        #[serde(default)]
        callbacks: Vec<Callback>,
    },
}

impl TypeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Entity { .. } => "entity",
            Self::MappedSuperclass => "mapped_superclass",
            Self::Embeddable => "embeddable",
            Self::Listener { .. } => "listener",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyGeneration {
    /// The application assigns the key before `create`.
    #[default]
    Assigned,
    /// The database generates the key during INSERT.
    Identity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub column: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub load_group: usize,
    /// Embeddable type whose fields are flattened into this field's columns.
    #[serde(default)]
    pub embedded: Option<String>,
}

fn default_nullable() -> bool {
    true
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            data_type,
            nullable: true,
            load_group: 0,
            embedded: None,
        }
    }

    pub fn embedded(name: impl Into<String>, embeddable: impl Into<String>) -> Self {
        let mut field = Self::new(name, DataType::Text);
        field.embedded = Some(embeddable.into());
        field
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn group(mut self, load_group: usize) -> Self {
        self.load_group = load_group;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
    #[serde(default)]
    pub cascade: CascadeSet,
}

impl RelationDescriptor {
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
        load_group: usize,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ManyToOne {
                column: column.into(),
                load_group,
            },
            cascade: CascadeSet::default(),
        }
    }

    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::OneToMany {
                mapped_by: mapped_by.into(),
            },
            cascade: CascadeSet::default(),
        }
    }

    pub fn cascade(mut self, cascade: CascadeSet) -> Self {
        self.cascade = cascade;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelationKind {
    /// Owning side: a foreign-key column in this type's table.
    ManyToOne { column: String, load_group: usize },
    /// Inverse side of a `ManyToOne` declared on the target.
    OneToMany { mapped_by: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CascadeSet {
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub remove: bool,
}

impl CascadeSet {
    pub const NONE: Self = Self {
        persist: false,
        remove: false,
    };
    pub const PERSIST: Self = Self {
        persist: true,
        remove: false,
    };
    pub const REMOVE: Self = Self {
        persist: false,
        remove: true,
    };
    pub const ALL: Self = Self {
        persist: true,
        remove: true,
    };
}

/// Life-cycle points at which listeners are notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callback {
    PostLoad,
    PrePersist,
    PostPersist,
    PreUpdate,
    PostUpdate,
    PreRemove,
    PostRemove,
}
