// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Administrative utilities: entity-name-indexed introspection and key
// rotation for operators.
//
// Rolling a tuple reloads it under a row lock and writes it back with the
// newest keys. Run rolls inside a transaction so the lock is held until
// the rewritten tuple is committed.

use std::collections::BTreeMap;
use std::path::Path;

use rowguard_core::error::{Result, RowguardError};
use rowguard_core::sql::{Row, SqlExecutor, SqlValue};
use rowguard_core::types::{CanonicalFormUsage, EntitySummary, TupleInfo};
use rowguard_security::RotationAudit;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::dao::{GetOptions, Mapper, not_found};
use crate::entity::Entity;
use crate::registry::TableMapping;
use crate::row::SIGNER_COLUMN;

const ROLL_SIGNED: &str = "roll_signed";
const ROLL_ENCRYPTED: &str = "roll_encrypted";

impl Mapper {
    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    pub fn list_entities(&self) -> Vec<EntitySummary> {
        self.registry().iter().map(TableMapping::summary).collect()
    }

    pub fn list_signed_entities(&self) -> Vec<String> {
        self.registry()
            .iter()
            .filter(|m| m.is_signed())
            .map(|m| m.entity_name.to_owned())
            .collect()
    }

    pub fn list_encrypted_entities(&self) -> Vec<String> {
        self.registry()
            .iter()
            .filter(|m| m.is_encrypted())
            .map(|m| m.entity_name.to_owned())
            .collect()
    }

    /// Keys of every tuple of the entity, in key order.
    #[instrument(skip(self, db))]
    pub fn list_tuples_by_entity(&self, db: &mut dyn SqlExecutor, entity: &str) -> Result<Vec<String>> {
        let mapping = self.registry().by_name(entity)?;
        let key = mapping.primary_key()?;
        let sql = format!(
            "SELECT {key} FROM {table} ORDER BY {key}",
            key = key.column,
            table = mapping.table_name
        );
        Ok(db.query(&sql, &[])?.iter().map(first_text).collect())
    }

    /// Rows of a signed entity grouped by the canonical form that signed
    /// them, newest form first.
    #[instrument(skip(self, db))]
    pub fn list_canonical_forms_by_entity(
        &self,
        db: &mut dyn SqlExecutor,
        entity: &str,
    ) -> Result<Vec<CanonicalFormUsage>> {
        let mapping = signed_mapping(self, entity)?;
        let latest = mapping.signing_template().map(|t| t.signer()).unwrap_or_default();
        let sql = format!(
            "SELECT {SIGNER_COLUMN}, COUNT(*) FROM {} GROUP BY {SIGNER_COLUMN}",
            mapping.table_name
        );

        let mut usages = db
            .query(&sql, &[])?
            .iter()
            .map(|row| {
                let signer = first_text(row);
                let template = mapping
                    .templates()
                    .iter()
                    .find(|t| t.signer() == signer)
                    .map(|t| t.source().to_owned())
                    .unwrap_or_default();
                CanonicalFormUsage {
                    latest: signer == latest,
                    count: row.get_index(1).and_then(SqlValue::as_i64).unwrap_or(0),
                    signer,
                    template,
                }
            })
            .collect::<Vec<_>>();
        usages.sort_by(|a, b| b.latest.cmp(&a.latest).then(b.count.cmp(&a.count)));
        Ok(usages)
    }

    /// Keys of the tuples signed with the canonical form `signer`.
    #[instrument(skip(self, db))]
    pub fn list_tuples_by_canonical_form(
        &self,
        db: &mut dyn SqlExecutor,
        entity: &str,
        signer: &str,
    ) -> Result<Vec<String>> {
        let mapping = signed_mapping(self, entity)?;
        let key = mapping.primary_key()?;
        let sql = format!(
            "SELECT {key} FROM {table} WHERE {SIGNER_COLUMN} = {p} ORDER BY {key}",
            key = key.column,
            table = mapping.table_name,
            p = db.dialect().placeholder(1)
        );
        let rows = db.query(&sql, &[SqlValue::Text(signer.to_owned())])?;
        Ok(rows.iter().map(first_text).collect())
    }

    // -----------------------------------------------------------------------
    // Point operations
    // -----------------------------------------------------------------------

    /// Load a tuple by entity name and key, as JSON with secrets masked.
    pub fn load_tuple_by_primary_key(
        &self,
        db: &mut dyn SqlExecutor,
        entity: &str,
        pk: &str,
    ) -> Result<Value> {
        let mapping = self.registry().by_name(entity)?;
        (mapping.ops.load)(self, db, pk, false)
    }

    /// Like [`Mapper::load_tuple_by_primary_key`], also locking the row for
    /// the rest of the caller's transaction. Contention fails with `Locked`.
    pub fn load_and_lock_tuple_by_primary_key(
        &self,
        db: &mut dyn SqlExecutor,
        entity: &str,
        pk: &str,
    ) -> Result<Value> {
        let mapping = self.registry().by_name(entity)?;
        (mapping.ops.load)(self, db, pk, true)
    }

    /// Re-sign a tuple with the newest canonical form and signing key.
    pub fn roll_signed_tuple_by_primary_key(
        &self,
        db: &mut dyn SqlExecutor,
        entity: &str,
        pk: &str,
    ) -> Result<TupleInfo> {
        let mapping = self.registry().by_name(entity)?;
        (mapping.ops.roll_signed)(self, db, pk)
    }

    /// Re-encrypt (and re-sign, when signed) a tuple with the newest keys.
    pub fn roll_encrypted_tuple_by_primary_key(
        &self,
        db: &mut dyn SqlExecutor,
        entity: &str,
        pk: &str,
    ) -> Result<TupleInfo> {
        let mapping = self.registry().by_name(entity)?;
        (mapping.ops.roll_encrypted)(self, db, pk)
    }

    /// Which key versions a tuple is currently signed and encrypted with.
    pub fn info_tuple_by_primary_key(
        &self,
        db: &mut dyn SqlExecutor,
        entity: &str,
        pk: &str,
    ) -> Result<TupleInfo> {
        let mapping = self.registry().by_name(entity)?;
        (mapping.ops.info)(self, db, pk)
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    /// Collect tuple infos in batches of `batch_size`, reporting each batch
    /// to `on_batch`.
    #[instrument(skip(self, db, pks, on_batch), fields(count = pks.len()))]
    pub fn info_tuples<F>(
        &self,
        db: &mut dyn SqlExecutor,
        entity: &str,
        pks: &[String],
        batch_size: usize,
        mut on_batch: F,
    ) -> Result<EntityReport>
    where
        F: FnMut(&[TupleInfo]),
    {
        check_batch_size(batch_size)?;
        let mut report = EntityReport::new(entity);
        for batch in pks.chunks(batch_size) {
            let infos = batch
                .iter()
                .map(|pk| self.info_tuple_by_primary_key(db, entity, pk))
                .collect::<Result<Vec<_>>>()?;
            on_batch(&infos);
            report.extend(infos);
        }
        Ok(report)
    }

    /// Roll tuples in batches of `batch_size`: re-encrypt encrypted entities,
    /// re-sign signed ones.
    ///
    /// Tuples locked by another transaction are skipped; any other failure
    /// stops the run. Every attempt is recorded in `audit` when given.
    #[instrument(skip(self, db, pks, audit, on_batch), fields(count = pks.len()))]
    pub fn roll_tuples<F>(
        &self,
        db: &mut dyn SqlExecutor,
        entity: &str,
        pks: &[String],
        batch_size: usize,
        audit: Option<&RotationAudit>,
        mut on_batch: F,
    ) -> Result<Vec<TupleInfo>>
    where
        F: FnMut(&[TupleInfo]),
    {
        check_batch_size(batch_size)?;
        let mapping = self.registry().by_name(entity)?;
        let (action, roll) = if mapping.is_encrypted() {
            (ROLL_ENCRYPTED, mapping.ops.roll_encrypted)
        } else if mapping.is_signed() {
            (ROLL_SIGNED, mapping.ops.roll_signed)
        } else {
            return Err(RowguardError::InvalidData(format!(
                "{entity} is neither signed nor encrypted"
            )));
        };

        let mut rolled = Vec::with_capacity(pks.len());
        for batch in pks.chunks(batch_size) {
            let mut infos = Vec::with_capacity(batch.len());
            for pk in batch {
                match roll(self, db, pk.as_str()) {
                    Ok(tuple) => {
                        if let Some(audit) = audit {
                            let key_ts = tuple.encryption_ts.or(tuple.signature_ts);
                            audit.record(entity, pk, action, key_ts, true, None)?;
                        }
                        infos.push(tuple);
                    }
                    Err(e) => {
                        if let Some(audit) = audit {
                            audit.record(entity, pk, action, None, false, Some(&e.to_string()))?;
                        }
                        if !e.is_locked() {
                            return Err(e);
                        }
                        warn!(%entity, %pk, "tuple locked, skipped");
                    }
                }
            }
            on_batch(&infos);
            rolled.extend(infos);
        }
        info!(%entity, rolled = rolled.len(), requested = pks.len(), "roll finished");
        Ok(rolled)
    }
}

fn signed_mapping<'a>(mapper: &'a Mapper, entity: &str) -> Result<&'a TableMapping> {
    let mapping = mapper.registry().by_name(entity)?;
    if !mapping.is_signed() {
        return Err(RowguardError::InvalidData(format!("{entity} is not signed")));
    }
    Ok(mapping)
}

fn check_batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(RowguardError::InvalidData("batch size must be at least 1".into()));
    }
    Ok(())
}

fn first_text(row: &Row) -> String {
    row.get_index(0).map(SqlValue::to_text).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Monomorphized operations behind the name-keyed API
// ---------------------------------------------------------------------------

pub(crate) fn load_erased<T: Entity>(
    mapper: &Mapper,
    db: &mut dyn SqlExecutor,
    pk: &str,
    lock: bool,
) -> Result<Value> {
    let entity: T = mapper.load_by_primary_key(db, pk, lock, GetOptions::default())?;
    Ok(serde_json::to_value(&entity)?)
}

#[instrument(skip(mapper, db), fields(entity = T::NAME))]
pub(crate) fn roll_signed_erased<T: Entity>(
    mapper: &Mapper,
    db: &mut dyn SqlExecutor,
    pk: &str,
) -> Result<TupleInfo> {
    let mapping = mapper.registry().get::<T>()?;
    if !mapping.is_signed() {
        return Err(RowguardError::InvalidData(format!("{} is not signed", T::NAME)));
    }
    let loaded = mapper
        .select_by_key::<T, _>(db, mapping, pk, true)?
        .ok_or_else(|| not_found(mapping, pk))?;
    // Rows signed with an older canonical form are verified against that
    // form before being re-signed with the newest one.
    if mapper.verify_loaded_by_signer(mapping, &loaded)?.is_none() {
        warn!("signature does not verify, tuple not rolled");
        return Err(not_found(mapping, pk));
    }
    mapper.db_sign_with(db, mapping, &loaded.entity)?;
    info!("signature rolled");
    info_erased::<T>(mapper, db, pk)
}

#[instrument(skip(mapper, db), fields(entity = T::NAME))]
pub(crate) fn roll_encrypted_erased<T: Entity>(
    mapper: &Mapper,
    db: &mut dyn SqlExecutor,
    pk: &str,
) -> Result<TupleInfo> {
    let mapping = mapper.registry().get::<T>()?;
    if !mapping.is_encrypted() {
        return Err(RowguardError::InvalidData(format!("{} is not encrypted", T::NAME)));
    }
    let loaded = mapper
        .select_by_key::<T, _>(db, mapping, pk, true)?
        .ok_or_else(|| not_found(mapping, pk))?;
    if mapping.is_signed() && mapper.verify_loaded_by_signer(mapping, &loaded)?.is_none() {
        warn!("signature does not verify, tuple not rolled");
        return Err(not_found(mapping, pk));
    }

    let mut entity = loaded.entity;
    mapper.get_encrypted_data_with(db, mapping, &mut entity)?;
    mapper.update_encrypted_data_with(db, mapping, &entity)?;
    if mapping.is_signed() {
        mapper.db_sign_with(db, mapping, &entity)?;
    }
    info!("encrypted data rolled");
    info_erased::<T>(mapper, db, pk)
}

pub(crate) fn info_erased<T: Entity>(
    mapper: &Mapper,
    db: &mut dyn SqlExecutor,
    pk: &str,
) -> Result<TupleInfo> {
    let mapping = mapper.registry().get::<T>()?;
    let loaded = mapper
        .select_by_key::<T, _>(db, mapping, pk, false)?
        .ok_or_else(|| not_found(mapping, pk))?;

    let signature_ts = if mapping.is_signed() {
        let key = mapper
            .verify_loaded_by_signer(mapping, &loaded)?
            .ok_or_else(|| not_found(mapping, pk))?;
        Some(key.timestamp)
    } else {
        None
    };

    let mut entity = loaded.entity;
    let encryption_ts = if mapping.is_encrypted() {
        mapper
            .get_encrypted_data_with(db, mapping, &mut entity)?
            .map(|key| key.timestamp)
    } else {
        None
    };
    debug!(entity = T::NAME, %pk, ?signature_ts, ?encryption_ts, "tuple info");

    Ok(TupleInfo {
        pk: pk.to_owned(),
        signed: mapping.is_signed(),
        encrypted: mapping.is_encrypted(),
        signature_ts,
        encryption_ts,
    })
}

// ---------------------------------------------------------------------------
// Rotation report
// ---------------------------------------------------------------------------

/// Tuple infos of one entity, keyed by primary key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReport {
    pub entity: String,
    pub tuples: BTreeMap<String, TupleInfo>,
}

impl EntityReport {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            tuples: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, info: TupleInfo) {
        self.tuples.insert(info.pk.clone(), info);
    }

    /// Signature key timestamp → keys of the tuples signed with it.
    pub fn signature_report(&self) -> BTreeMap<i64, Vec<String>> {
        self.group_by(|info| info.signature_ts)
    }

    /// Encryption key timestamp → keys of the tuples encrypted with it.
    pub fn encryption_report(&self) -> BTreeMap<i64, Vec<String>> {
        self.group_by(|info| info.encryption_ts)
    }

    /// Tuples still signed or encrypted with the key `timestamp`.
    pub fn keys_for_timestamp(&self, timestamp: i64) -> Vec<String> {
        self.tuples
            .values()
            .filter(|info| {
                info.signature_ts == Some(timestamp) || info.encryption_ts == Some(timestamp)
            })
            .map(|info| info.pk.clone())
            .collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    fn group_by(&self, key: impl Fn(&TupleInfo) -> Option<i64>) -> BTreeMap<i64, Vec<String>> {
        let mut groups: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for info in self.tuples.values() {
            if let Some(ts) = key(info) {
                groups.entry(ts).or_default().push(info.pk.clone());
            }
        }
        groups
    }
}

impl Extend<TupleInfo> for EntityReport {
    fn extend<I: IntoIterator<Item = TupleInfo>>(&mut self, iter: I) {
        for info in iter {
            self.insert(info);
        }
    }
}
