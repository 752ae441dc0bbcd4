// ============================================================================
// Mapping Metadata
// ============================================================================
//
// Descriptors are the external, read-only description of mapped types. The
// registry validates them once and derives a `TypeLayout` per entity type,
// which is everything the runtime needs at execution time.
//
// ============================================================================

pub mod descriptor;
pub mod layout;
pub mod listener;
pub mod registry;

pub use descriptor::{
    Callback, CascadeSet, FieldDescriptor, KeyGeneration, RelationDescriptor, RelationKind,
    TypeDescriptor, TypeKind,
};
pub use layout::{
    ColumnRef, DiscriminatorLayout, FieldId, GroupLayout, SlotKind, SlotLayout, TableLayout,
    TypeLayout,
};
pub use listener::EntityListener;
pub use registry::{RegistryBuilder, TypeRegistry};
