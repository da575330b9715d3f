// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Entity registry: table mappings built once at start-up and read-only
// afterwards.

use std::any::TypeId;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rowguard_core::error::{Result, RowguardError};
use rowguard_core::sql::SqlExecutor;
use rowguard_core::types::{EntitySummary, TupleInfo};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::admin;
use crate::canonical::{CanonicalForms, Template};
use crate::dao::Mapper;
use crate::entity::{ColumnKind, Entity, Field, Signed};
use crate::row::{SIGNATURE_COLUMN, SIGNER_COLUMN, to_object};

/// Embedded structs may nest at most this deep.
const MAX_EMBED_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// Table mapping
// ---------------------------------------------------------------------------

/// Table name, key columns and key generation of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    primary_key: Vec<String>,
    auto_increment: bool,
}

impl Table {
    /// A table keyed by a single column.
    pub fn new(name: impl Into<String>, primary_key: &str) -> Self {
        Self::with_key_columns(name, &[primary_key])
    }

    pub fn with_key_columns(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            primary_key: columns.iter().map(|c| (*c).to_owned()).collect(),
            auto_increment: false,
        }
    }

    /// The database generates the key on insert.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }
}

/// A plain column and the serialized field it stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub field: &'static str,
    pub column: &'static str,
    pub kind: ColumnKind,
}

/// An encrypted field, its ciphertext column and its AAD fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    pub field: &'static str,
    pub column: &'static str,
    pub extras: Vec<&'static str>,
}

pub(crate) type LoadFn = fn(&Mapper, &mut dyn SqlExecutor, &str, bool) -> Result<Value>;
pub(crate) type TupleFn = fn(&Mapper, &mut dyn SqlExecutor, &str) -> Result<TupleInfo>;

/// Monomorphized operations reachable by entity name.
#[derive(Clone, Copy)]
pub(crate) struct EntityOps {
    pub load: LoadFn,
    pub roll_signed: TupleFn,
    pub roll_encrypted: TupleFn,
    pub info: TupleFn,
}

impl EntityOps {
    fn of<T: Entity>() -> Self {
        Self {
            load: admin::load_erased::<T>,
            roll_signed: admin::roll_signed_erased::<T>,
            roll_encrypted: admin::roll_encrypted_erased::<T>,
            info: admin::info_erased::<T>,
        }
    }
}

impl std::fmt::Debug for EntityOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityOps").finish_non_exhaustive()
    }
}

/// Everything the mapper knows about a registered entity type.
#[derive(Debug, Clone)]
pub struct TableMapping {
    pub entity_name: &'static str,
    pub table_name: String,
    pub auto_increment: bool,
    pub primary_key_columns: Vec<String>,
    /// Plain columns, embedded fields included, in declaration order.
    pub columns: Vec<ColumnMap>,
    pub encrypted_fields: Vec<EncryptedField>,
    target: TypeId,
    /// Compiled canonical forms, newest first. Empty for unsigned entities.
    templates: Vec<Template>,
    pub(crate) ops: EntityOps,
}

impl TableMapping {
    pub fn is_signed(&self) -> bool {
        !self.templates.is_empty()
    }

    pub fn is_encrypted(&self) -> bool {
        !self.encrypted_fields.is_empty()
    }

    /// The single key column. Composite keys are rejected here.
    pub fn primary_key(&self) -> Result<&ColumnMap> {
        match self.primary_key_columns.as_slice() {
            [column] => self.column(column),
            _ => Err(RowguardError::InvalidData(format!(
                "{} has a composite primary key",
                self.entity_name
            ))),
        }
    }

    pub(crate) fn key_columns(&self) -> Result<Vec<&ColumnMap>> {
        self.primary_key_columns
            .iter()
            .map(|column| self.column(column))
            .collect()
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.primary_key_columns.iter().any(|c| c == column)
    }

    fn column(&self, column: &str) -> Result<&ColumnMap> {
        self.columns
            .iter()
            .find(|c| c.column == column)
            .ok_or_else(|| {
                RowguardError::InvalidData(format!("{} has no column {column}", self.entity_name))
            })
    }

    /// Template used to sign new rows.
    pub fn signing_template(&self) -> Option<&Template> {
        self.templates.first()
    }

    /// Canonical form templates, newest first.
    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn summary(&self) -> EntitySummary {
        EntitySummary {
            name: self.entity_name.to_owned(),
            table: self.table_name.clone(),
            signed: self.is_signed(),
            encrypted: self.is_encrypted(),
        }
    }

    fn same_shape(&self, other: &Self) -> bool {
        self.target == other.target
            && self.table_name == other.table_name
            && self.auto_increment == other.auto_increment
            && self.primary_key_columns == other.primary_key_columns
            && self.columns == other.columns
            && self.encrypted_fields == other.encrypted_fields
            && self.templates == other.templates
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable set of table mappings, looked up by type or by entity name.
#[derive(Debug, Default)]
pub struct Registry {
    by_type: HashMap<TypeId, TableMapping>,
    by_name: BTreeMap<&'static str, TypeId>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get<T: Entity>(&self) -> Result<&TableMapping> {
        self.by_type
            .get(&TypeId::of::<T>())
            .ok_or_else(|| RowguardError::UnknownEntity(T::NAME.to_owned()))
    }

    pub fn by_name(&self, name: &str) -> Result<&TableMapping> {
        self.by_name
            .get(name)
            .and_then(|id| self.by_type.get(id))
            .ok_or_else(|| RowguardError::UnknownEntity(name.to_owned()))
    }

    /// Mappings ordered by entity name.
    pub fn iter(&self) -> impl Iterator<Item = &TableMapping> {
        self.by_name.values().filter_map(|id| self.by_type.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// Collects registrations; [`RegistryBuilder::build`] freezes them.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// Register an unsigned entity. Registering the same mapping twice is a
    /// no-op; registering a different one for the same type or name fails.
    pub fn register<T: Entity>(&mut self, table: Table) -> Result<&TableMapping> {
        let mapping = build_mapping::<T>(table, None)?;
        self.insert(mapping)
    }

    /// Register an entity whose rows are signed over its canonical forms.
    pub fn register_signed<T: Signed>(&mut self, table: Table) -> Result<&TableMapping> {
        let mapping = build_mapping::<T>(table, Some(T::canonical_forms()))?;
        self.insert(mapping)
    }

    pub fn build(self) -> Registry {
        info!(entities = self.registry.len(), "entity registry built");
        self.registry
    }

    fn insert(&mut self, mapping: TableMapping) -> Result<&TableMapping> {
        let Registry { by_type, by_name } = &mut self.registry;

        if let Some(id) = by_name.get(mapping.entity_name) {
            if *id != mapping.target {
                return Err(RowguardError::registration(
                    mapping.entity_name,
                    "name already registered by another type",
                ));
            }
        }

        match by_type.entry(mapping.target) {
            Entry::Occupied(existing) => {
                if !existing.get().same_shape(&mapping) {
                    return Err(RowguardError::registration(
                        mapping.entity_name,
                        "already registered with a different mapping",
                    ));
                }
                debug!(entity = mapping.entity_name, "entity already registered");
                Ok(existing.into_mut())
            }
            Entry::Vacant(slot) => {
                by_name.insert(mapping.entity_name, mapping.target);
                info!(
                    entity = mapping.entity_name,
                    table = %mapping.table_name,
                    signed = mapping.is_signed(),
                    encrypted = mapping.is_encrypted(),
                    "entity registered"
                );
                Ok(slot.insert(mapping))
            }
        }
    }
}

fn flatten_fields(
    fields: Vec<Field>,
    depth: usize,
    columns: &mut Vec<ColumnMap>,
    encrypted: &mut Vec<EncryptedField>,
) -> std::result::Result<(), String> {
    if depth > MAX_EMBED_DEPTH {
        return Err(format!(
            "embedded fields nest deeper than {MAX_EMBED_DEPTH} levels"
        ));
    }
    for field in fields {
        match field {
            Field::Column {
                field,
                column,
                kind,
            } => columns.push(ColumnMap {
                field,
                column,
                kind,
            }),
            Field::Encrypted {
                field,
                column,
                extras,
            } => encrypted.push(EncryptedField {
                field,
                column,
                extras,
            }),
            Field::Embedded(inner) => flatten_fields(inner(), depth + 1, columns, encrypted)?,
        }
    }
    Ok(())
}

#[instrument(skip_all, fields(entity = T::NAME, table = %table.name))]
fn build_mapping<T: Entity>(table: Table, forms: Option<CanonicalForms>) -> Result<TableMapping> {
    let fail = |reason: String| RowguardError::registration(T::NAME, reason);

    if table.name.is_empty() {
        return Err(fail("empty table name".into()));
    }

    let mut columns = Vec::new();
    let mut encrypted_fields = Vec::new();
    flatten_fields(T::fields(), 0, &mut columns, &mut encrypted_fields).map_err(fail)?;

    let mut seen_fields = HashSet::new();
    let mut seen_columns = HashSet::new();
    let declared = columns
        .iter()
        .map(|c| (c.field, c.column))
        .chain(encrypted_fields.iter().map(|e| (e.field, e.column)));
    for (field, column) in declared {
        if !seen_fields.insert(field) {
            return Err(fail(format!("field {field} declared twice")));
        }
        if !seen_columns.insert(column) {
            return Err(fail(format!("column {column} declared twice")));
        }
        if column == SIGNATURE_COLUMN || column == SIGNER_COLUMN {
            return Err(fail(format!("column {column} is reserved")));
        }
    }

    // Keys.
    if table.primary_key.is_empty() {
        return Err(fail("no primary key column".into()));
    }
    for key in &table.primary_key {
        if !columns.iter().any(|c| c.column == key) {
            return Err(fail(format!(
                "primary key column {key} is not a plain column"
            )));
        }
    }
    let single_integer_key = matches!(
        table.primary_key.as_slice(),
        [key] if columns.iter().any(|c| c.column == key && c.kind == ColumnKind::Integer)
    );
    if table.auto_increment && !single_integer_key {
        return Err(fail(
            "auto increment needs a single integer key column".into(),
        ));
    }
    if (forms.is_some() || !encrypted_fields.is_empty()) && table.primary_key.len() != 1 {
        return Err(fail(
            "signed or encrypted entities need a single key column".into(),
        ));
    }

    // Every declaration must match the serialized shape.
    let zero = T::default();
    let object = to_object(&zero).map_err(|e| fail(e.to_string()))?;
    for column in &columns {
        if !object.contains_key(column.field) {
            return Err(fail(format!("field {} is not serialized", column.field)));
        }
    }
    let encrypted_names: BTreeSet<&str> = encrypted_fields.iter().map(|e| e.field).collect();
    for encrypted in &encrypted_fields {
        if !object.contains_key(encrypted.field) {
            return Err(fail(format!("field {} is not serialized", encrypted.field)));
        }
        for extra in &encrypted.extras {
            if !object.contains_key(*extra) {
                return Err(fail(format!(
                    "extra {extra} of {} is not serialized",
                    encrypted.field
                )));
            }
            if encrypted_names.contains(extra) {
                return Err(fail(format!(
                    "extra {extra} of {} is itself encrypted",
                    encrypted.field
                )));
            }
        }
    }

    let readable: BTreeSet<&str> = zero.secrets().iter().map(|(name, _)| *name).collect();
    let mut zero_mut = T::default();
    let writable: BTreeSet<&str> = zero_mut
        .secrets_mut()
        .iter()
        .map(|(name, _)| *name)
        .collect();
    if readable != encrypted_names || writable != encrypted_names {
        return Err(fail(format!(
            "secret accessors {readable:?} / {writable:?} do not match encrypted fields {encrypted_names:?}"
        )));
    }

    // Canonical forms must compile, avoid secrets and render on the zero value.
    let projection = Value::Object(object);
    let templates = match forms {
        None => Vec::new(),
        Some(forms) if forms.is_empty() => {
            return Err(fail("signed entity declares no canonical form".into()));
        }
        Some(forms) => forms
            .iter()
            .map(|form| {
                let template = Template::compile(form.template()).map_err(|e| fail(e.to_string()))?;
                if let Some(secret) = template
                    .referenced_fields()
                    .find(|name| encrypted_names.contains(name))
                {
                    return Err(fail(format!(
                        "canonical form {:?} reads encrypted field {secret}",
                        form.template()
                    )));
                }
                template.render(&projection).map_err(|e| {
                    fail(format!(
                        "canonical form {:?} does not render: {e}",
                        form.template()
                    ))
                })?;
                Ok(template)
            })
            .collect::<Result<Vec<_>>>()?,
    };

    Ok(TableMapping {
        entity_name: T::NAME,
        table_name: table.name,
        auto_increment: table.auto_increment,
        primary_key_columns: table.primary_key,
        columns,
        encrypted_fields,
        target: TypeId::of::<T>(),
        templates,
        ops: EntityOps::of::<T>(),
    })
}
