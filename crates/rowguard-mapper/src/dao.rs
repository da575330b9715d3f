// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Generic data access: insert, update, delete and query any registered
// entity, with signing and field encryption applied transparently.
//
// Multi-statement writes (insert, then encrypt, then sign) are not atomic by
// themselves: run them on a `Transaction` when partial writes matter.

use std::sync::Arc;

use rowguard_core::config::MapperConfig;
use rowguard_core::error::{Result, RowguardError};
use rowguard_core::keyring::Keyring;
use rowguard_core::sql::{Dialect, Query, SqlExecutor, SqlValue};
use rowguard_security::AeadKeyring;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::entity::Entity;
use crate::registry::{ColumnMap, Registry, TableMapping};
use crate::row::{Loaded, decode_row, field, json_text, json_to_sql, replace_field, sql_to_json, to_object};

/// Read options for [`Mapper::get`] and [`Mapper::get_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Decrypt encrypted fields instead of returning them masked.
    pub with_decryption: bool,
}

impl GetOptions {
    pub const WITH_DECRYPTION: Self = Self {
        with_decryption: true,
    };
}

/// Entry point of the persistence layer: the registry plus the signing and
/// encryption keyrings.
pub struct Mapper {
    registry: Registry,
    signature_key: Arc<dyn Keyring>,
    encryption_key: Arc<dyn Keyring>,
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Mapper {
    pub fn new(
        registry: Registry,
        signature_key: Arc<dyn Keyring>,
        encryption_key: Arc<dyn Keyring>,
    ) -> Self {
        Self {
            registry,
            signature_key,
            encryption_key,
        }
    }

    /// Build both keyrings from configuration.
    pub fn from_config(registry: Registry, config: &MapperConfig) -> Result<Self> {
        let signature_key = AeadKeyring::from_config(&config.signature)?;
        let encryption_key = AeadKeyring::from_config(&config.encryption)?;
        Ok(Self::new(
            registry,
            Arc::new(signature_key),
            Arc::new(encryption_key),
        ))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn signature_key(&self) -> &dyn Keyring {
        self.signature_key.as_ref()
    }

    pub(crate) fn encryption_key(&self) -> &dyn Keyring {
        self.encryption_key.as_ref()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert a new row, then store its ciphertexts and signature.
    ///
    /// A generated key is written back into `entity`. On return every
    /// encrypted field is masked.
    #[instrument(skip_all, fields(entity = T::NAME))]
    pub fn insert<T, E>(&self, db: &mut E, entity: &mut T) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let mapping = self.registry.get::<T>()?;
        if let Some((name, _)) = entity.secrets().into_iter().find(|(_, s)| s.is_masked()) {
            return Err(RowguardError::InvalidData(format!(
                "cannot insert {}: field {name} is masked",
                T::NAME
            )));
        }

        let object = to_object(entity)?;
        let dialect = db.dialect();
        let mut columns = Vec::new();
        let mut args = Vec::new();
        for column in &mapping.columns {
            if mapping.auto_increment && mapping.is_key_column(column.column) {
                continue;
            }
            columns.push(column.column);
            args.push(json_to_sql(field(&object, column.field)?, column.kind)?);
        }

        let mut sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", mapping.table_name)
        } else {
            let placeholders: Vec<String> =
                (1..=args.len()).map(|n| dialect.placeholder(n)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                mapping.table_name,
                columns.join(", "),
                placeholders.join(", ")
            )
        };

        if mapping.auto_increment {
            let key = mapping.primary_key()?;
            sql.push_str(&format!(" RETURNING {}", key.column));
            let generated = db
                .query(&sql, &args)?
                .into_iter()
                .next()
                .and_then(|mut row| row.take(key.column))
                .ok_or_else(|| {
                    RowguardError::Database(format!("{sql} returned no generated key"))
                })?;
            replace_field(entity, key.field, sql_to_json(generated, key.kind)?)?;
        } else {
            expect_one(&sql, db.execute(&sql, &args)?)?;
        }

        if mapping.is_encrypted() {
            self.update_encrypted_data_with(db, mapping, entity)?;
        }
        if mapping.is_signed() {
            self.db_sign_with(db, mapping, entity)?;
        }
        self.reset_encrypted_data(entity);
        debug!(table = %mapping.table_name, "tuple inserted");
        Ok(())
    }

    /// Update every column of an existing row.
    pub fn update<T, E>(&self, db: &mut E, entity: &mut T) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        self.update_columns(db, entity, |_| true)
    }

    /// Update the non-key columns accepted by `filter`, then refresh the
    /// ciphertexts and signature.
    ///
    /// Encrypted fields still masked in `entity` keep their stored value.
    #[instrument(skip_all, fields(entity = T::NAME))]
    pub fn update_columns<T, E, F>(&self, db: &mut E, entity: &mut T, filter: F) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
        F: Fn(&ColumnMap) -> bool,
    {
        let mapping = self.registry.get::<T>()?;
        if entity.secrets().iter().any(|(_, s)| s.is_masked()) {
            self.restore_masked(db, mapping, entity)?;
        }

        let object = to_object(entity)?;
        let dialect = db.dialect();
        let mut assignments = Vec::new();
        let mut args = Vec::new();
        for column in &mapping.columns {
            if mapping.is_key_column(column.column) || !filter(column) {
                continue;
            }
            args.push(json_to_sql(field(&object, column.field)?, column.kind)?);
            assignments.push(format!(
                "{} = {}",
                column.column,
                dialect.placeholder(args.len())
            ));
        }

        if assignments.is_empty() {
            if !mapping.is_encrypted() && !mapping.is_signed() {
                return Err(RowguardError::InvalidData(format!(
                    "no column of {} selected for update",
                    T::NAME
                )));
            }
        } else {
            let (predicate, key_args) = key_predicate(dialect, mapping, &object, args.len() + 1)?;
            args.extend(key_args);
            let sql = format!(
                "UPDATE {} SET {} WHERE {predicate}",
                mapping.table_name,
                assignments.join(", ")
            );
            expect_one(&sql, db.execute(&sql, &args)?)?;
        }

        if mapping.is_encrypted() {
            self.update_encrypted_data_with(db, mapping, entity)?;
        }
        if mapping.is_signed() {
            self.db_sign_with(db, mapping, entity)?;
        }
        self.reset_encrypted_data(entity);
        debug!(table = %mapping.table_name, columns = assignments.len(), "tuple updated");
        Ok(())
    }

    /// Delete the row matching the entity key. Deleting a missing row is not
    /// an error.
    #[instrument(skip_all, fields(entity = T::NAME))]
    pub fn delete<T, E>(&self, db: &mut E, entity: &T) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let mapping = self.registry.get::<T>()?;
        let object = to_object(entity)?;
        let (predicate, args) = key_predicate(db.dialect(), mapping, &object, 1)?;
        let sql = format!("DELETE FROM {} WHERE {predicate}", mapping.table_name);
        let deleted = db.execute(&sql, &args)?;
        debug!(table = %mapping.table_name, deleted, "tuple deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Run `query` and decode at most one row.
    ///
    /// A row whose signature does not verify is reported as absent.
    #[instrument(skip_all, fields(entity = T::NAME))]
    pub fn get<T, E>(&self, db: &mut E, query: &Query, options: GetOptions) -> Result<Option<T>>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let mapping = self.registry.get::<T>()?;
        let sql = query.sql();
        let mut rows = db.query(&sql, query.arguments())?;
        if rows.len() > 1 {
            return Err(RowguardError::Database(format!(
                "{} rows returned by {sql}, expected at most one",
                rows.len()
            )));
        }
        let Some(row) = rows.pop() else {
            return Ok(None);
        };

        let loaded = decode_row::<T>(mapping, row)?;
        if mapping.is_signed() && self.verify_loaded(mapping, &loaded)?.is_none() {
            warn!(table = %mapping.table_name, "signature does not verify, tuple ignored");
            return Ok(None);
        }

        let mut entity = loaded.entity;
        if options.with_decryption && mapping.is_encrypted() {
            self.get_encrypted_data_with(db, mapping, &mut entity)?;
        }
        Ok(Some(entity))
    }

    /// Run `query` and decode every row, skipping rows whose signature does
    /// not verify.
    #[instrument(skip_all, fields(entity = T::NAME))]
    pub fn get_all<T, E>(&self, db: &mut E, query: &Query, options: GetOptions) -> Result<Vec<T>>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let mapping = self.registry.get::<T>()?;
        let rows = db.query(&query.sql(), query.arguments())?;
        let fetched = rows.len();

        let mut entities = Vec::with_capacity(fetched);
        for row in rows {
            let loaded = decode_row::<T>(mapping, row)?;
            if mapping.is_signed() && self.verify_loaded(mapping, &loaded)?.is_none() {
                warn!(table = %mapping.table_name, "signature does not verify, tuple skipped");
                continue;
            }
            entities.push(loaded.entity);
        }

        if options.with_decryption && mapping.is_encrypted() && !entities.is_empty() {
            self.get_encrypted_slice_data_with(db, mapping, &mut entities)?;
        }
        debug!(fetched, kept = entities.len(), "tuples loaded");
        Ok(entities)
    }

    /// Run a single-value query. No row, or a NULL value, reads as zero.
    pub fn get_int<E>(&self, db: &mut E, query: &Query) -> Result<i64>
    where
        E: SqlExecutor + ?Sized,
    {
        let rows = db.query(&query.sql(), query.arguments())?;
        let Some(value) = rows.first().and_then(|row| row.get_index(0)) else {
            return Ok(0);
        };
        match value {
            SqlValue::Null => Ok(0),
            SqlValue::Integer(i) => Ok(*i),
            SqlValue::Real(f) => Ok(*f as i64),
            SqlValue::Text(s) => s.trim().parse().map_err(|_| {
                RowguardError::InvalidData(format!("{s:?} is not an integer"))
            }),
            SqlValue::Blob(_) => Err(RowguardError::InvalidData(
                "blob value where an integer was expected".into(),
            )),
        }
    }

    /// Load one row by the textual form of its key, verifying its signature.
    ///
    /// A missing row and a row whose signature does not verify both fail with
    /// `NotFound`. With `lock`, the row is locked for the rest of the caller's
    /// transaction and contention fails fast with `Locked`.
    #[instrument(skip_all, fields(entity = T::NAME, %pk, lock))]
    pub fn load_by_primary_key<T, E>(
        &self,
        db: &mut E,
        pk: &str,
        lock: bool,
        options: GetOptions,
    ) -> Result<T>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let mapping = self.registry.get::<T>()?;
        let loaded = self
            .select_by_key::<T, E>(db, mapping, pk, lock)?
            .ok_or_else(|| not_found(mapping, pk))?;
        if mapping.is_signed() && self.verify_loaded(mapping, &loaded)?.is_none() {
            warn!(table = %mapping.table_name, "signature does not verify");
            return Err(not_found(mapping, pk));
        }

        let mut entity = loaded.entity;
        if options.with_decryption && mapping.is_encrypted() {
            self.get_encrypted_data_with(db, mapping, &mut entity)?;
        }
        Ok(entity)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Fetch the raw row for `pk` without any signature check.
    pub(crate) fn select_by_key<T, E>(
        &self,
        db: &mut E,
        mapping: &TableMapping,
        pk: &str,
        lock: bool,
    ) -> Result<Option<Loaded<T>>>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let key = mapping.primary_key()?;
        let dialect = db.dialect();
        let args = [SqlValue::Text(pk.to_owned())];

        if lock && dialect == Dialect::Sqlite {
            // SQLite has no row locks: a self-assignment takes the write lock
            // of the enclosing transaction, failing fast when another writer
            // holds it.
            let sql = format!(
                "UPDATE {table} SET {col} = {col} WHERE {predicate}",
                table = mapping.table_name,
                col = key.column,
                predicate = dialect.text_eq(key.column, 1)
            );
            if db.execute(&sql, &args)? == 0 {
                return Ok(None);
            }
        }

        let sql = format!(
            "SELECT * FROM {} WHERE {}{}",
            mapping.table_name,
            dialect.text_eq(key.column, 1),
            if lock { dialect.lock_clause() } else { "" }
        );
        db.query(&sql, &args)?
            .into_iter()
            .next()
            .map(|row| decode_row::<T>(mapping, row))
            .transpose()
    }

    /// Replace masked secrets of `entity` with the plaintext currently
    /// stored for its row.
    fn restore_masked<T, E>(&self, db: &mut E, mapping: &TableMapping, entity: &mut T) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let key = mapping.primary_key()?;
        let pk = json_text(field(&to_object(entity)?, key.field)?);
        let mut stored = self
            .select_by_key::<T, E>(db, mapping, &pk, false)?
            .ok_or_else(|| not_found(mapping, &pk))?
            .entity;
        self.get_encrypted_data_with(db, mapping, &mut stored)?;

        let plaintexts = stored
            .secrets()
            .into_iter()
            .map(|(name, secret)| Ok::<_, RowguardError>((name, secret.plaintext_json()?)))
            .collect::<Result<Vec<_>>>()?;
        for (name, secret) in entity.secrets_mut() {
            if !secret.is_masked() {
                continue;
            }
            if let Some((_, Some(plaintext))) = plaintexts.iter().find(|(known, _)| *known == name) {
                secret.set_plaintext_json(plaintext)?;
                debug!(field = name, "masked field restored from storage");
            }
        }
        Ok(())
    }
}

/// `key = ?n AND ...` over the key columns, with the entity's key values.
pub(crate) fn key_predicate(
    dialect: Dialect,
    mapping: &TableMapping,
    object: &Map<String, Value>,
    first: usize,
) -> Result<(String, Vec<SqlValue>)> {
    let mut clauses = Vec::new();
    let mut args = Vec::new();
    for (offset, key) in mapping.key_columns()?.into_iter().enumerate() {
        clauses.push(format!(
            "{} = {}",
            key.column,
            dialect.placeholder(first + offset)
        ));
        args.push(json_to_sql(field(object, key.field)?, key.kind)?);
    }
    Ok((clauses.join(" AND "), args))
}

pub(crate) fn expect_one(query: &str, affected: u64) -> Result<()> {
    if affected == 1 {
        Ok(())
    } else {
        Err(RowguardError::UnexpectedRowCount {
            query: query.to_owned(),
            expected: 1,
            actual: affected,
        })
    }
}

pub(crate) fn not_found(mapping: &TableMapping, pk: &str) -> RowguardError {
    RowguardError::NotFound(format!("{} {pk}", mapping.entity_name))
}
