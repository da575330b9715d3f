// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! rowguard-mapper: Tamper-evident, field-encrypted persistence for
//! registered entities.
//!
//! Entities are registered once against a table. Signed entities carry a
//! signature of their canonical form in a `sig` column, so edits made behind
//! the mapper's back make the row read as absent. Encrypted fields are
//! stored as AEAD ciphertexts bound to other fields of the same row, and
//! come back masked unless decryption is requested.
//!
//! Administrative helpers address entities by name and roll tuples onto the
//! newest keys in batches.

pub mod admin;
pub mod canonical;
pub mod dao;
pub mod encryption;
pub mod entity;
pub mod registry;
pub mod row;
pub mod signature;

#[cfg(test)]
pub(crate) mod testing;

// PUBLIC API: Re-export the mapper surface
pub use admin::EntityReport;
pub use canonical::{CanonicalForm, CanonicalForms, Template};
pub use dao::{GetOptions, Mapper};
pub use entity::{ColumnKind, Entity, Field, Signed};
pub use registry::{ColumnMap, EncryptedField, Registry, RegistryBuilder, Table, TableMapping};
pub use row::{SIGNATURE_COLUMN, SIGNER_COLUMN};
