// ============================================================================
// Load-Group Index
// ============================================================================
//
// A `TypeLayout` is the flattened, numbered view of one concrete entity type:
// its inheritance chain, storage tables, slots (the get/set dispatch table),
// and the load groups with the ordered column list each group selects.
//
// Numbering: mapped superclasses above the persistable root share the root's
// local group numbers; every type below the root starts after the highest
// global group used so far.
//
// ============================================================================

use super::descriptor::{
    Callback, CascadeSet, FieldDescriptor, KeyGeneration, RelationKind, TypeDescriptor, TypeKind,
};
use crate::core::{DataType, DbError, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

pub type FieldId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    Scalar,
    Embedded { embeddable: String },
    ManyToOne { target: String },
    OneToMany { target: String, mapped_by: String },
}

#[derive(Debug, Clone)]
pub struct SlotLayout {
    pub id: FieldId,
    pub name: String,
    /// Type in the chain that declares the slot.
    pub owner: String,
    pub kind: SlotKind,
    /// Global load group; `None` for inverse collections.
    pub group: Option<usize>,
    pub columns: Vec<ColumnRef>,
    pub cascade: CascadeSet,
    pub version: bool,
}

impl SlotLayout {
    pub fn is_relation(&self) -> bool {
        matches!(
            self.kind,
            SlotKind::ManyToOne { .. } | SlotKind::OneToMany { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct GroupLayout {
    pub index: usize,
    pub owner: String,
    pub table: String,
    pub slots: Vec<FieldId>,
    pub columns: Vec<ColumnRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub name: String,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscriminatorLayout {
    pub column: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TypeLayout {
    name: String,
    root: String,
    chain: Vec<String>,
    tables: Vec<TableLayout>,
    key: Vec<ColumnRef>,
    key_generation: KeyGeneration,
    slots: Vec<SlotLayout>,
    field_ids: HashMap<String, FieldId>,
    groups: Vec<GroupLayout>,
    version: Option<FieldId>,
    discriminator: Option<DiscriminatorLayout>,
    callbacks: HashMap<Callback, Vec<String>>,
    cacheable: bool,
}

impl TypeLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The persistable root: the first entity in the chain. Cache items and
    /// identity maps are keyed by this name.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// Storage tables in ancestor-to-descendant order; the first is the primary table.
    pub fn tables(&self) -> &[TableLayout] {
        &self.tables
    }

    pub fn primary_table(&self) -> &str {
        &self.tables[0].name
    }

    pub fn key_columns(&self) -> &[ColumnRef] {
        &self.key
    }

    pub fn key_column_names(&self) -> Vec<&str> {
        self.key.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn key_generation(&self) -> KeyGeneration {
        self.key_generation
    }

    pub fn slots(&self) -> &[SlotLayout] {
        &self.slots
    }

    pub fn slot(&self, id: FieldId) -> &SlotLayout {
        &self.slots[id]
    }

    pub fn field_id(&self, name: &str) -> Option<FieldId> {
        self.field_ids.get(name).copied()
    }

    pub fn field(&self, name: &str) -> Result<&SlotLayout> {
        self.field_id(name)
            .map(|id| &self.slots[id])
            .ok_or_else(|| DbError::UnknownField {
                type_name: self.name.clone(),
                field: name.to_string(),
            })
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of 64-bit mask words an instance of this type needs.
    pub fn mask_words(&self) -> usize {
        self.groups.len().div_ceil(64).max(1)
    }

    pub fn groups(&self) -> &[GroupLayout] {
        &self.groups
    }

    /// # Panics
    /// Panics on a group index the type does not have; callers derive group
    /// indices from this layout, so an unknown one is a programming error.
    pub fn group(&self, group: usize) -> &GroupLayout {
        match self.groups.get(group) {
            Some(layout) => layout,
            None => panic!(
                "load group {} out of range for type {} ({} groups)",
                group,
                self.name,
                self.groups.len()
            ),
        }
    }

    /// Ordered column list of one group, for positional result binding.
    ///
    /// # Panics
    /// Panics on an unknown group index.
    pub fn columns_for(&self, group: usize) -> &[ColumnRef] {
        &self.group(group).columns
    }

    /// Columns a SELECT for `group` returns: the group's columns, followed by
    /// the discriminator column when the root group of a polymorphic
    /// hierarchy is requested.
    ///
    /// # Panics
    /// Panics on an unknown group index.
    pub fn select_columns(&self, group: usize) -> Vec<&str> {
        let mut columns: Vec<&str> = self
            .columns_for(group)
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        if group == 0 {
            if let Some(discriminator) = &self.discriminator {
                columns.push(discriminator.column.as_str());
            }
        }
        columns
    }

    /// Groups stored in `table`, ascending.
    pub fn groups_in_table<'a>(&'a self, table: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.groups
            .iter()
            .filter(move |g| g.table == table)
            .map(|g| g.index)
    }

    pub fn version_slot(&self) -> Option<&SlotLayout> {
        self.version.map(|id| &self.slots[id])
    }

    pub fn discriminator(&self) -> Option<&DiscriminatorLayout> {
        self.discriminator.as_ref()
    }

    pub fn listeners_for(&self, callback: Callback) -> &[String] {
        self.callbacks
            .get(&callback)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn relation_slots(&self) -> impl Iterator<Item = &SlotLayout> {
        self.slots.iter().filter(|s| s.is_relation())
    }

    pub(crate) fn build(
        descriptors: &HashMap<String, TypeDescriptor>,
        name: &str,
    ) -> Result<Self> {
        let chain = resolve_chain(descriptors, name)?;
        let chain_desc: Vec<&TypeDescriptor> =
            chain.iter().map(|n| &descriptors[n.as_str()]).collect();

        let concrete = chain_desc[chain_desc.len() - 1];
        if !concrete.is_entity() {
            return Err(invalid(format!(
                "layouts are built for entity types, '{}' is a {}",
                name,
                concrete.kind.label()
            )));
        }

        let root_idx = chain_desc
            .iter()
            .position(|d| d.is_entity())
            .ok_or_else(|| invalid(format!("type '{}' has no entity in its chain", name)))?;
        let root = chain_desc[root_idx];
        let root_table = root.table().unwrap_or_default().to_string();

        let storage_tables = storage_tables(&chain_desc);

        // Key: declared once, at or above the persistable root.
        let mut key_fields: Option<&[FieldDescriptor]> = None;
        for (idx, desc) in chain_desc.iter().enumerate() {
            if desc.key.is_empty() {
                continue;
            }
            if idx > root_idx {
                return Err(invalid(format!(
                    "type '{}' declares a key below the persistable root '{}'",
                    desc.name, root.name
                )));
            }
            if key_fields.is_some() {
                return Err(invalid(format!(
                    "key declared more than once in the chain of '{}'",
                    name
                )));
            }
            key_fields = Some(&desc.key);
        }
        let key_fields =
            key_fields.ok_or_else(|| invalid(format!("type '{}' has no primary key", name)))?;
        let key: Vec<ColumnRef> = key_fields
            .iter()
            .map(|f| ColumnRef {
                table: root_table.clone(),
                name: f.column.clone(),
                data_type: f.data_type,
                nullable: false,
            })
            .collect();

        let key_generation = match &root.kind {
            TypeKind::Entity { key_generation, .. } => *key_generation,
            _ => KeyGeneration::Assigned,
        };
        if key_generation == KeyGeneration::Identity && key.len() != 1 {
            return Err(invalid(format!(
                "identity key generation on '{}' requires a single key column",
                root.name
            )));
        }

        // Global group offsets per chain position.
        let mut offsets = vec![0usize; chain_desc.len()];
        let shared: BTreeSet<usize> = chain_desc[..=root_idx]
            .iter()
            .flat_map(|d| local_groups(d))
            .chain(std::iter::once(0))
            .collect();
        check_contiguous(&shared, &root.name)?;
        let mut next_group = shared.len();
        for (idx, desc) in chain_desc.iter().enumerate().skip(root_idx + 1) {
            let local = local_groups(desc);
            check_contiguous(&local, &desc.name)?;
            offsets[idx] = next_group;
            next_group += local.len();
        }

        let mut groups: Vec<GroupLayout> = Vec::with_capacity(next_group);
        for index in 0..next_group {
            let position = if index < shared.len() {
                root_idx
            } else {
                (root_idx + 1..chain_desc.len())
                    .filter(|&i| offsets[i] <= index)
                    .last()
                    .unwrap_or(root_idx)
            };
            groups.push(GroupLayout {
                index,
                owner: chain_desc[position].name.clone(),
                table: storage_tables[position].clone(),
                slots: Vec::new(),
                columns: Vec::new(),
            });
        }

        let mut slots: Vec<SlotLayout> = Vec::new();
        let mut field_ids: HashMap<String, FieldId> = HashMap::new();
        for (idx, desc) in chain_desc.iter().enumerate() {
            let table = &storage_tables[idx];
            for field in &desc.fields {
                let group = offsets[idx] + field.load_group;
                let (kind, columns) = match &field.embedded {
                    Some(embeddable) => {
                        let columns = embedded_columns(descriptors, field, embeddable, table)?;
                        (
                            SlotKind::Embedded {
                                embeddable: embeddable.clone(),
                            },
                            columns,
                        )
                    }
                    None => (
                        SlotKind::Scalar,
                        vec![ColumnRef {
                            table: table.clone(),
                            name: field.column.clone(),
                            data_type: field.data_type,
                            nullable: field.nullable,
                        }],
                    ),
                };
                push_slot(
                    &mut slots,
                    &mut field_ids,
                    SlotLayout {
                        id: 0,
                        name: field.name.clone(),
                        owner: desc.name.clone(),
                        kind,
                        group: Some(group),
                        columns,
                        cascade: CascadeSet::NONE,
                        version: false,
                    },
                )?;
            }
            for relation in &desc.relations {
                let target = descriptors.get(&relation.target).ok_or_else(|| {
                    invalid(format!(
                        "relation '{}.{}' targets unknown type '{}'",
                        desc.name, relation.name, relation.target
                    ))
                })?;
                if !target.is_entity() {
                    return Err(invalid(format!(
                        "relation '{}.{}' must target an entity, '{}' is a {}",
                        desc.name,
                        relation.name,
                        target.name,
                        target.kind.label()
                    )));
                }
                let (kind, group, columns) = match &relation.kind {
                    RelationKind::ManyToOne { column, load_group } => {
                        let target_key = chain_key(descriptors, &relation.target)?;
                        if target_key.len() != 1 {
                            return Err(invalid(format!(
                                "relation '{}.{}' targets '{}' whose key is not a single column",
                                desc.name, relation.name, relation.target
                            )));
                        }
                        (
                            SlotKind::ManyToOne {
                                target: relation.target.clone(),
                            },
                            Some(offsets[idx] + load_group),
                            vec![ColumnRef {
                                table: table.clone(),
                                name: column.clone(),
                                data_type: target_key[0].data_type,
                                nullable: true,
                            }],
                        )
                    }
                    RelationKind::OneToMany { mapped_by } => (
                        SlotKind::OneToMany {
                            target: relation.target.clone(),
                            mapped_by: mapped_by.clone(),
                        },
                        None,
                        Vec::new(),
                    ),
                };
                push_slot(
                    &mut slots,
                    &mut field_ids,
                    SlotLayout {
                        id: 0,
                        name: relation.name.clone(),
                        owner: desc.name.clone(),
                        kind,
                        group,
                        columns,
                        cascade: relation.cascade,
                        version: false,
                    },
                )?;
            }
        }

        for slot in &slots {
            if let Some(group) = slot.group {
                let layout = &mut groups[group];
                layout.slots.push(slot.id);
                layout.columns.extend(slot.columns.iter().cloned());
            }
        }

        let version = match chain_desc[..=root_idx].iter().find_map(|d| d.version.as_ref()) {
            Some(field) => {
                let id = *field_ids.get(field).ok_or_else(|| {
                    invalid(format!("version field '{}' is not declared on '{}'", field, name))
                })?;
                let slot = &mut slots[id];
                let is_integer = slot.kind == SlotKind::Scalar
                    && slot.columns[0].data_type == DataType::Integer;
                if !is_integer || slot.group != Some(0) {
                    return Err(invalid(format!(
                        "version field '{}' must be an integer field in load group 0",
                        field
                    )));
                }
                slot.version = true;
                Some(id)
            }
            None => None,
        };

        let discriminator = match chain_desc[..=root_idx]
            .iter()
            .find_map(|d| d.discriminator.as_ref())
        {
            Some(column) => {
                let value = match &concrete.kind {
                    TypeKind::Entity {
                        discriminator_value,
                        ..
                    } => discriminator_value.clone(),
                    _ => None,
                };
                if value.is_none() {
                    return Err(invalid(format!(
                        "entity '{}' in a discriminated hierarchy needs a discriminator_value",
                        name
                    )));
                }
                Some(DiscriminatorLayout {
                    column: column.clone(),
                    value,
                })
            }
            None => None,
        };

        let mut callbacks: HashMap<Callback, Vec<String>> = HashMap::new();
        for desc in &chain_desc {
            for listener in &desc.listeners {
                let listener_desc = descriptors.get(listener).ok_or_else(|| {
                    invalid(format!(
                        "type '{}' names unknown listener '{}'",
                        desc.name, listener
                    ))
                })?;
                let TypeKind::Listener { callbacks: handled } = &listener_desc.kind else {
                    return Err(invalid(format!(
                        "'{}' is a {}, not a listener",
                        listener,
                        listener_desc.kind.label()
                    )));
                };
                for callback in handled {
                    callbacks
                        .entry(*callback)
                        .or_default()
                        .push(listener.clone());
                }
            }
        }

        let tables = chain_desc
            .iter()
            .filter_map(|d| {
                d.table().map(|t| TableLayout {
                    name: t.to_string(),
                    owner: d.name.clone(),
                })
            })
            .collect();

        Ok(Self {
            name: name.to_string(),
            root: root.name.clone(),
            cacheable: chain_desc.iter().all(|d| d.cacheable),
            chain,
            tables,
            key,
            key_generation,
            slots,
            field_ids,
            groups,
            version,
            discriminator,
            callbacks,
        })
    }
}

fn invalid(message: String) -> DbError {
    DbError::InvalidDescriptor(message)
}

fn resolve_chain(descriptors: &HashMap<String, TypeDescriptor>, name: &str) -> Result<Vec<String>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(name.to_string());
    while let Some(type_name) = current {
        if !seen.insert(type_name.clone()) {
            return Err(invalid(format!(
                "inheritance cycle through '{}'",
                type_name
            )));
        }
        let desc = descriptors
            .get(&type_name)
            .ok_or_else(|| DbError::UnknownType(type_name.clone()))?;
        if !matches!(
            desc.kind,
            TypeKind::Entity { .. } | TypeKind::MappedSuperclass
        ) {
            return Err(invalid(format!(
                "'{}' is a {} and cannot take part in an inheritance chain",
                desc.name,
                desc.kind.label()
            )));
        }
        current = desc.parent.clone();
        chain.push(type_name);
    }
    chain.reverse();
    Ok(chain)
}

fn chain_key<'a>(
    descriptors: &'a HashMap<String, TypeDescriptor>,
    name: &str,
) -> Result<&'a [FieldDescriptor]> {
    let chain = resolve_chain(descriptors, name)?;
    chain
        .iter()
        .map(|n| &descriptors[n.as_str()])
        .find(|d| !d.key.is_empty())
        .map(|d| d.key.as_slice())
        .ok_or_else(|| invalid(format!("type '{}' has no primary key", name)))
}

// Mapped superclasses store their columns in the nearest entity table below them.
fn storage_tables(chain: &[&TypeDescriptor]) -> Vec<String> {
    let mut tables = vec![String::new(); chain.len()];
    let mut below: Option<String> = None;
    for (idx, desc) in chain.iter().enumerate().rev() {
        if let Some(table) = desc.table() {
            below = Some(table.to_string());
        }
        tables[idx] = below.clone().unwrap_or_default();
    }
    tables
}

fn local_groups(desc: &TypeDescriptor) -> BTreeSet<usize> {
    let fields = desc.fields.iter().map(|f| f.load_group);
    let relations = desc.relations.iter().filter_map(|r| match &r.kind {
        RelationKind::ManyToOne { load_group, .. } => Some(*load_group),
        RelationKind::OneToMany { .. } => None,
    });
    fields.chain(relations).collect()
}

fn check_contiguous(groups: &BTreeSet<usize>, owner: &str) -> Result<()> {
    for (expected, actual) in groups.iter().enumerate() {
        if expected != *actual {
            return Err(invalid(format!(
                "load groups of '{}' must be contiguous from 0, found {:?}",
                owner, groups
            )));
        }
    }
    Ok(())
}

fn embedded_columns(
    descriptors: &HashMap<String, TypeDescriptor>,
    field: &FieldDescriptor,
    embeddable: &str,
    table: &str,
) -> Result<Vec<ColumnRef>> {
    let desc = descriptors
        .get(embeddable)
        .ok_or_else(|| DbError::UnknownType(embeddable.to_string()))?;
    if desc.kind != TypeKind::Embeddable {
        return Err(invalid(format!(
            "field '{}' embeds '{}', which is a {}",
            field.name,
            embeddable,
            desc.kind.label()
        )));
    }
    if desc.fields.iter().any(|f| f.embedded.is_some()) {
        return Err(invalid(format!(
            "embeddable '{}' may only contain scalar fields",
            embeddable
        )));
    }
    Ok(desc
        .fields
        .iter()
        .map(|inner| ColumnRef {
            table: table.to_string(),
            name: format!("{}_{}", field.column, inner.column),
            data_type: inner.data_type,
            nullable: inner.nullable,
        })
        .collect())
}

fn push_slot(
    slots: &mut Vec<SlotLayout>,
    field_ids: &mut HashMap<String, FieldId>,
    mut slot: SlotLayout,
) -> Result<()> {
    if field_ids.contains_key(&slot.name) {
        return Err(invalid(format!(
            "field '{}' is declared twice in the chain of '{}'",
            slot.name, slot.owner
        )));
    }
    slot.id = slots.len();
    field_ids.insert(slot.name.clone(), slot.id);
    slots.push(slot);
    Ok(())
}
