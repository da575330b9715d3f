// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Entity declarations: the traits a persisted type implements and the field
// descriptors the registry walks to build its table mapping.

use rowguard_core::types::Secret;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::canonical::CanonicalForms;

/// Storage class of a plain column, and how its JSON value is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    /// Stored as 0 / 1.
    Bool,
    /// Any JSON value, stored as its compact text encoding.
    Json,
    /// Byte vectors (serialized as arrays of numbers).
    Blob,
}

/// One declared field of an entity.
///
/// `field` is the serde key of the field, `column` the database column.
#[derive(Debug, Clone)]
pub enum Field {
    Column {
        field: &'static str,
        column: &'static str,
        kind: ColumnKind,
    },
    /// An `Encrypted<T>` field stored as ciphertext in `column`, bound to the
    /// current values of the `extras` fields.
    Encrypted {
        field: &'static str,
        column: &'static str,
        extras: Vec<&'static str>,
    },
    /// Fields of a `#[serde(flatten)]` struct, walked recursively.
    Embedded(fn() -> Vec<Field>),
}

impl Field {
    /// A column named after its field.
    pub fn column(field: &'static str, kind: ColumnKind) -> Self {
        Self::Column {
            field,
            column: field,
            kind,
        }
    }

    pub fn renamed(field: &'static str, column: &'static str, kind: ColumnKind) -> Self {
        Self::Column {
            field,
            column,
            kind,
        }
    }

    pub fn encrypted(field: &'static str, column: &'static str, extras: &[&'static str]) -> Self {
        Self::Encrypted {
            field,
            column,
            extras: extras.to_vec(),
        }
    }

    pub fn embedded(fields: fn() -> Vec<Field>) -> Self {
        Self::Embedded(fields)
    }
}

/// A type persisted through the mapper.
///
/// The serialized form must be a JSON object whose keys match the declared
/// fields. Every `Encrypted<T>` field must be declared with
/// [`Field::encrypted`] and exposed through [`Entity::secrets`] and
/// [`Entity::secrets_mut`] under the same name.
pub trait Entity: Serialize + DeserializeOwned + Default + 'static {
    /// Registry name, unique across the process.
    const NAME: &'static str;

    fn fields() -> Vec<Field>;

    fn secrets(&self) -> Vec<(&'static str, &dyn Secret)> {
        Vec::new()
    }

    fn secrets_mut(&mut self) -> Vec<(&'static str, &mut dyn Secret)> {
        Vec::new()
    }
}

/// An entity whose rows carry a signature over a canonical form.
pub trait Signed: Entity {
    /// Canonical form templates, newest first. Only the first one signs.
    fn canonical_forms() -> CanonicalForms;
}
