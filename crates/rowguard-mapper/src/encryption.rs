// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Field encryption: the JSON encoding of each encrypted field is sealed
// with the encryption keyring and stored in its own column.
//
// The current values of the field's extras are bound as additional
// authenticated data, so a ciphertext copied to another row (or left behind
// after an extra changed) no longer decrypts.

use std::collections::HashMap;

use rowguard_core::error::{Result, RowguardError};
use rowguard_core::keyring::KeyInfo;
use rowguard_core::sql::{Row, SqlExecutor, SqlValue};
use rowguard_security::canonical_json;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::dao::{Mapper, expect_one, key_predicate, not_found};
use crate::entity::Entity;
use crate::registry::{EncryptedField, TableMapping};
use crate::row::{field, json_text, to_object};

impl Mapper {
    /// Seal the JSON encoding of a field value, bound to `extras`.
    pub fn encrypt_field(&self, plaintext: &[u8], extras: &[Value]) -> Result<Vec<u8>> {
        self.encryption_key().encrypt(plaintext, &aad(extras))
    }

    /// Open a field ciphertext. Fails unless `extras` match the ones used to
    /// encrypt it.
    pub fn decrypt_field(&self, ciphertext: &[u8], extras: &[Value]) -> Result<Vec<u8>> {
        self.encryption_key().decrypt(ciphertext, &aad(extras))
    }

    /// Encrypt every encrypted field of `entity` and store the ciphertexts on
    /// its row in one statement.
    pub fn update_encrypted_data<T, E>(&self, db: &mut E, entity: &T) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let mapping = self.registry().get::<T>()?;
        self.update_encrypted_data_with(db, mapping, entity)
    }

    /// Mask every encrypted field of `entity`.
    pub fn reset_encrypted_data<T: Entity>(&self, entity: &mut T) {
        for (_, secret) in entity.secrets_mut() {
            secret.mask();
        }
    }

    /// Load and decrypt the stored ciphertexts of `entity` into its fields.
    pub fn get_encrypted_data<T, E>(&self, db: &mut E, entity: &mut T) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let mapping = self.registry().get::<T>()?;
        self.get_encrypted_data_with(db, mapping, entity)?;
        Ok(())
    }

    /// Batch form of [`Mapper::get_encrypted_data`]: one query for the whole
    /// slice, rows matched back to elements by key.
    pub fn get_encrypted_slice_data<T, E>(&self, db: &mut E, entities: &mut [T]) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let mapping = self.registry().get::<T>()?;
        self.get_encrypted_slice_data_with(db, mapping, entities)
    }

    // -----------------------------------------------------------------------
    // Type-erased helpers
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(entity = T::NAME))]
    pub(crate) fn update_encrypted_data_with<T, E>(
        &self,
        db: &mut E,
        mapping: &TableMapping,
        entity: &T,
    ) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let object = to_object(entity)?;
        let secrets = entity.secrets();
        let dialect = db.dialect();

        let mut assignments = Vec::new();
        let mut args = Vec::new();
        for encrypted in &mapping.encrypted_fields {
            let secret = secrets
                .iter()
                .find(|(name, _)| *name == encrypted.field)
                .map(|(_, secret)| *secret)
                .ok_or_else(|| {
                    RowguardError::InvalidData(format!(
                        "{} exposes no secret {}",
                        T::NAME,
                        encrypted.field
                    ))
                })?;
            let plaintext = secret.plaintext_json()?.ok_or_else(|| {
                RowguardError::InvalidData(format!(
                    "{}.{} is masked and cannot be encrypted",
                    T::NAME,
                    encrypted.field
                ))
            })?;
            let ciphertext = self.encrypt_field(&plaintext, &extra_values(&object, encrypted)?)?;
            args.push(SqlValue::Blob(ciphertext));
            assignments.push(format!(
                "{} = {}",
                encrypted.column,
                dialect.placeholder(args.len())
            ));
        }

        let (predicate, key_args) = key_predicate(dialect, mapping, &object, args.len() + 1)?;
        args.extend(key_args);
        let sql = format!(
            "UPDATE {} SET {} WHERE {predicate}",
            mapping.table_name,
            assignments.join(", ")
        );
        expect_one(&sql, db.execute(&sql, &args)?)?;
        debug!(fields = assignments.len(), "encrypted data stored");
        Ok(())
    }

    /// Decrypt the stored fields of one entity; reports the key that opened
    /// the first of them.
    #[instrument(skip_all, fields(entity = T::NAME))]
    pub(crate) fn get_encrypted_data_with<T, E>(
        &self,
        db: &mut E,
        mapping: &TableMapping,
        entity: &mut T,
    ) -> Result<Option<KeyInfo>>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let key = mapping.primary_key()?;
        let object = to_object(entity)?;
        let pk = json_text(field(&object, key.field)?);
        let dialect = db.dialect();

        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            ciphertext_columns(mapping),
            mapping.table_name,
            dialect.text_eq(key.column, 1)
        );
        let row = db
            .query(&sql, &[SqlValue::Text(pk.clone())])?
            .into_iter()
            .next()
            .ok_or_else(|| not_found(mapping, &pk))?;
        self.decrypt_row(mapping, &object, &row, entity)
    }

    #[instrument(skip_all, fields(entity = T::NAME, count = entities.len()))]
    pub(crate) fn get_encrypted_slice_data_with<T, E>(
        &self,
        db: &mut E,
        mapping: &TableMapping,
        entities: &mut [T],
    ) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        if entities.is_empty() {
            return Ok(());
        }
        let key = mapping.primary_key()?;
        let objects = entities
            .iter()
            .map(to_object)
            .collect::<Result<Vec<_>>>()?;

        // The same tuple may appear more than once in the slice.
        let mut targets: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, object) in objects.iter().enumerate() {
            targets
                .entry(json_text(field(object, key.field)?))
                .or_default()
                .push(idx);
        }
        let keys: Vec<&String> = targets.keys().collect();

        let dialect = db.dialect();
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE {}",
            key.column,
            ciphertext_columns(mapping),
            mapping.table_name,
            dialect.text_in_json_array(key.column, 1)
        );
        let rows = db.query(&sql, &[SqlValue::Text(serde_json::to_string(&keys)?)])?;

        let mut decrypted = 0;
        for row in rows {
            let pk = row.get(key.column).map(SqlValue::to_text).unwrap_or_default();
            let indexes = targets.get(&pk).ok_or_else(|| {
                RowguardError::Database(format!(
                    "{} row {pk} matches no requested element",
                    mapping.entity_name
                ))
            })?;
            for &idx in indexes {
                self.decrypt_row(mapping, &objects[idx], &row, &mut entities[idx])?;
            }
            decrypted += indexes.len();
        }
        if decrypted != entities.len() {
            return Err(RowguardError::NotFound(format!(
                "{}: encrypted data found for {decrypted} of {} elements",
                mapping.entity_name,
                entities.len()
            )));
        }
        debug!(rows = targets.len(), "encrypted data loaded");
        Ok(())
    }

    fn decrypt_row<T: Entity>(
        &self,
        mapping: &TableMapping,
        object: &Map<String, Value>,
        row: &Row,
        entity: &mut T,
    ) -> Result<Option<KeyInfo>> {
        let mut first_key = None;
        let mut plaintexts = Vec::with_capacity(mapping.encrypted_fields.len());
        for encrypted in &mapping.encrypted_fields {
            let ciphertext = row
                .get(encrypted.column)
                .and_then(SqlValue::as_blob)
                .ok_or_else(|| {
                    RowguardError::Decryption(format!(
                        "no ciphertext stored for {}.{}",
                        mapping.entity_name, encrypted.field
                    ))
                })?;
            let (plaintext, info) = self
                .encryption_key()
                .decrypt_with_info(ciphertext, &aad(&extra_values(object, encrypted)?))?;
            first_key.get_or_insert(info);
            plaintexts.push((encrypted.field, plaintext));
        }

        for (name, secret) in entity.secrets_mut() {
            if let Some((_, plaintext)) = plaintexts.iter().find(|(field, _)| *field == name) {
                secret.set_plaintext_json(plaintext)?;
            }
        }
        Ok(first_key)
    }
}

fn ciphertext_columns(mapping: &TableMapping) -> String {
    mapping
        .encrypted_fields
        .iter()
        .map(|f| f.column)
        .collect::<Vec<_>>()
        .join(", ")
}

fn extra_values(object: &Map<String, Value>, encrypted: &EncryptedField) -> Result<Vec<Value>> {
    encrypted
        .extras
        .iter()
        .map(|name| field(object, name).cloned())
        .collect()
}

/// Each extra is bound by its canonical JSON encoding.
fn aad(extras: &[Value]) -> Vec<Vec<u8>> {
    extras
        .iter()
        .map(|extra| canonical_json(extra).into_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::GetOptions;
    use crate::testing::{Credential, VaultItem, mapper, mapper_with_keys, memory_db};
    use rowguard_core::sql::Query;
    use rowguard_core::types::Encrypted;
    use serde_json::json;

    fn vault_item(name: &str, secret: &str) -> VaultItem {
        VaultItem {
            id: 0,
            name: name.into(),
            secret: Encrypted::plain(secret.into()),
        }
    }

    #[test]
    fn field_ciphertext_is_bound_to_extras() {
        let mapper = mapper();
        let ciphertext = mapper
            .encrypt_field(b"\"s3cr3t\"", &[json!(1), json!("alice")])
            .expect("encrypt");
        assert_eq!(
            mapper
                .decrypt_field(&ciphertext, &[json!(1), json!("alice")])
                .expect("decrypt"),
            b"\"s3cr3t\""
        );
        assert!(mapper.decrypt_field(&ciphertext, &[json!(2), json!("alice")]).is_err());
        assert!(mapper.decrypt_field(&ciphertext, &[json!("1"), json!("alice")]).is_err());
        assert!(mapper.decrypt_field(&ciphertext, &[json!(1)]).is_err());
    }

    #[test]
    fn ciphertext_moved_to_another_row_does_not_decrypt() {
        let mapper = mapper();
        let mut db = memory_db();
        let mut first = vault_item("a", "first-secret");
        let mut second = vault_item("b", "second-secret");
        mapper.insert(&mut db, &mut first).expect("insert a");
        mapper.insert(&mut db, &mut second).expect("insert b");

        db.execute(
            "UPDATE vault_item SET cipher_secret =
                 (SELECT cipher_secret FROM vault_item WHERE id = ?1) WHERE id = ?2",
            rusqlite::params![first.id, second.id],
        )
        .expect("swap");

        let err = mapper.get_encrypted_data(&mut db, &mut second).unwrap_err();
        assert!(matches!(err, RowguardError::Decryption(_)));
    }

    #[test]
    fn one_undecryptable_row_fails_the_decrypting_batch_read() {
        let mapper = mapper();
        let mut db = memory_db();
        let mut first = vault_item("a", "first-secret");
        let mut second = vault_item("b", "second-secret");
        mapper.insert(&mut db, &mut first).expect("insert a");
        mapper.insert(&mut db, &mut second).expect("insert b");
        db.execute(
            "UPDATE vault_item SET cipher_secret =
                 (SELECT cipher_secret FROM vault_item WHERE id = ?1) WHERE id = ?2",
            rusqlite::params![first.id, second.id],
        )
        .expect("swap");

        let query = Query::new("SELECT * FROM vault_item ORDER BY id");
        let err = mapper
            .get_all::<VaultItem, _>(&mut db, &query, GetOptions::WITH_DECRYPTION)
            .unwrap_err();
        assert!(matches!(err, RowguardError::Decryption(_)));

        // Masked reads are unaffected.
        let masked: Vec<VaultItem> = mapper
            .get_all(&mut db, &query, GetOptions::default())
            .expect("masked read");
        assert_eq!(masked.len(), 2);
    }

    #[test]
    fn reset_masks_every_secret() {
        let mapper = mapper();
        let mut cred = Credential::sample("alice");
        mapper.reset_encrypted_data(&mut cred);
        assert!(cred.token.is_masked());
        assert!(cred.config.is_masked());
    }

    #[test]
    fn update_encrypted_data_refuses_masked_values() {
        let mapper = mapper();
        let mut db = memory_db();
        let mut item = vault_item("a", "x");
        mapper.insert(&mut db, &mut item).expect("insert");
        let err = mapper.update_encrypted_data(&mut db, &item).unwrap_err();
        assert!(matches!(err, RowguardError::InvalidData(_)));
    }

    #[test]
    fn get_encrypted_data_of_missing_row_is_not_found() {
        let mapper = mapper();
        let mut db = memory_db();
        let mut ghost = vault_item("ghost", "x");
        ghost.id = 99;
        let err = mapper.get_encrypted_data(&mut db, &mut ghost).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn slice_decryption_matches_rows_by_key() {
        let mapper = mapper();
        let mut db = memory_db();
        for (name, secret) in [("a", "alpha"), ("b", "beta"), ("c", "gamma")] {
            mapper
                .insert(&mut db, &mut vault_item(name, secret))
                .expect("insert");
        }

        let mut items: Vec<VaultItem> = mapper
            .get_all(
                &mut db,
                &Query::new("SELECT * FROM vault_item ORDER BY name DESC"),
                GetOptions::default(),
            )
            .expect("get all");
        // Duplicate element for the same tuple.
        items.push(items[0].clone());
        assert!(items.iter().all(|i| i.secret.is_masked()));

        mapper
            .get_encrypted_slice_data(&mut db, &mut items)
            .expect("decrypt slice");
        let secrets: Vec<&str> = items
            .iter()
            .map(|i| i.secret.as_plain().map(String::as_str).unwrap_or(""))
            .collect();
        assert_eq!(secrets, ["gamma", "beta", "alpha", "gamma"]);
    }

    #[test]
    fn slice_decryption_reports_missing_rows() {
        let mapper = mapper();
        let mut db = memory_db();
        let mut item = vault_item("a", "alpha");
        mapper.insert(&mut db, &mut item).expect("insert");
        let mut ghost = vault_item("ghost", "x");
        ghost.id = 404;

        let mut items = vec![item, ghost];
        let err = mapper
            .get_encrypted_slice_data(&mut db, &mut items)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn rotated_encryption_key_reads_old_rows_and_writes_new_ones() {
        let mut db = memory_db();
        let mut item = vault_item("a", "alpha");
        mapper_with_keys(&[1], &[1])
            .insert(&mut db, &mut item)
            .expect("insert");

        let rotated = mapper_with_keys(&[1], &[1, 2]);
        let mut loaded: VaultItem = rotated
            .load_by_primary_key(&mut db, &item.id.to_string(), false, GetOptions::WITH_DECRYPTION)
            .expect("load");
        assert_eq!(loaded.secret.as_plain().map(String::as_str), Some("alpha"));

        let mapping = rotated.registry().get::<VaultItem>().expect("mapping");
        let info = rotated
            .get_encrypted_data_with(&mut db, mapping, &mut loaded)
            .expect("decrypt");
        assert_eq!(info.map(|k| k.timestamp), Some(1));

        rotated.update(&mut db, &mut loaded).expect("re-encrypt");
        let info = rotated
            .get_encrypted_data_with(&mut db, mapping, &mut loaded)
            .expect("decrypt");
        assert_eq!(info.map(|k| k.timestamp), Some(2));
    }
}
