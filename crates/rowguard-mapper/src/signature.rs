// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Row signatures: the canonical form of an entity sealed with the signing
// keyring. A signature verifies when it decrypts to exactly the canonical
// bytes of the entity as loaded.

use rowguard_core::error::{Result, RowguardError};
use rowguard_core::keyring::KeyInfo;
use rowguard_core::sql::{SqlExecutor, SqlValue};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::canonical::Template;
use crate::dao::{Mapper, expect_one, key_predicate};
use crate::entity::{Entity, Signed};
use crate::registry::TableMapping;
use crate::row::{Loaded, SIGNATURE_COLUMN, SIGNER_COLUMN, to_object};

impl Mapper {
    /// Canonical bytes of `entity` under its newest canonical form.
    pub fn canonical_bytes<T: Signed>(&self, entity: &T) -> Result<Vec<u8>> {
        let template = signing_template(self.registry().get::<T>()?)?;
        render(template, entity)
    }

    /// Sign `entity` with the newest canonical form and signing key.
    pub fn sign<T: Signed>(&self, entity: &T) -> Result<Vec<u8>> {
        let template = signing_template(self.registry().get::<T>()?)?;
        self.sign_with(template, entity)
    }

    /// Whether `signature` matches `entity` under the newest canonical form.
    ///
    /// A signature that does not decrypt counts as a mismatch. Only failing
    /// to render the canonical form is an error.
    pub fn check_signature<T: Signed>(&self, entity: &T, signature: &[u8]) -> Result<bool> {
        let template = signing_template(self.registry().get::<T>()?)?;
        Ok(self.verify_with(template, entity, signature)?.is_some())
    }

    /// Sign `entity` and store the signature and signer on its row.
    pub fn db_sign<T, E>(&self, db: &mut E, entity: &T) -> Result<()>
    where
        T: Signed,
        E: SqlExecutor + ?Sized,
    {
        let mapping = self.registry().get::<T>()?;
        self.db_sign_with(db, mapping, entity)
    }

    // -----------------------------------------------------------------------
    // Type-erased helpers
    // -----------------------------------------------------------------------

    pub(crate) fn sign_with<T: Entity>(&self, template: &Template, entity: &T) -> Result<Vec<u8>> {
        let canonical = render(template, entity)?;
        self.signature_key().encrypt(&canonical, &[])
    }

    /// Key that produced a valid signature, or `None` for any mismatch.
    pub(crate) fn verify_with<T: Entity>(
        &self,
        template: &Template,
        entity: &T,
        signature: &[u8],
    ) -> Result<Option<KeyInfo>> {
        let canonical = render(template, entity)?;
        match self.signature_key().decrypt_with_info(signature, &[]) {
            Ok((expected, info)) if expected == canonical => Ok(Some(info)),
            Ok(_) => {
                debug!(entity = T::NAME, "canonical form mismatch");
                Ok(None)
            }
            Err(e) => {
                debug!(entity = T::NAME, error = %e, "signature does not decrypt");
                Ok(None)
            }
        }
    }

    /// Verify a freshly decoded row against the newest canonical form.
    pub(crate) fn verify_loaded<T: Entity>(
        &self,
        mapping: &TableMapping,
        loaded: &Loaded<T>,
    ) -> Result<Option<KeyInfo>> {
        let Some(signature) = &loaded.signature else {
            debug!(entity = T::NAME, "row carries no signature");
            return Ok(None);
        };
        self.verify_with(signing_template(mapping)?, &loaded.entity, signature)
    }

    /// Verify a row against the canonical form named by its signer column,
    /// falling back to the newest form for unknown signers.
    pub(crate) fn verify_loaded_by_signer<T: Entity>(
        &self,
        mapping: &TableMapping,
        loaded: &Loaded<T>,
    ) -> Result<Option<KeyInfo>> {
        let Some(signature) = &loaded.signature else {
            return Ok(None);
        };
        let template = loaded
            .signer
            .as_deref()
            .and_then(|signer| mapping.templates().iter().find(|t| t.signer() == signer))
            .map_or_else(|| signing_template(mapping), Ok)?;
        self.verify_with(template, &loaded.entity, signature)
    }

    #[instrument(skip_all, fields(entity = T::NAME))]
    pub(crate) fn db_sign_with<T, E>(
        &self,
        db: &mut E,
        mapping: &TableMapping,
        entity: &T,
    ) -> Result<()>
    where
        T: Entity,
        E: SqlExecutor + ?Sized,
    {
        let template = signing_template(mapping)?;
        let signature = self.sign_with(template, entity)?;

        let dialect = db.dialect();
        let mut args = vec![
            SqlValue::Blob(signature),
            SqlValue::Text(template.signer().to_owned()),
        ];
        let (predicate, key_args) = key_predicate(dialect, mapping, &to_object(entity)?, 3)?;
        args.extend(key_args);
        let sql = format!(
            "UPDATE {} SET {SIGNATURE_COLUMN} = {}, {SIGNER_COLUMN} = {} WHERE {predicate}",
            mapping.table_name,
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        expect_one(&sql, db.execute(&sql, &args)?)?;
        debug!(signer = template.signer(), "tuple signed");
        Ok(())
    }
}

fn signing_template(mapping: &TableMapping) -> Result<&Template> {
    mapping.signing_template().ok_or_else(|| {
        RowguardError::InvalidData(format!("{} is not registered as signed", mapping.entity_name))
    })
}

fn render<T: Entity>(template: &Template, entity: &T) -> Result<Vec<u8>> {
    template.render(&Value::Object(to_object(entity)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Counter, Credential, Rule, mapper, mapper_with_keys, memory_db};
    use chrono::{TimeZone, Utc};
    use rowguard_core::sql::Query;

    #[test]
    fn signature_verifies_until_a_signed_field_changes() {
        let mapper = mapper();
        let mut rule = Rule::sample("lint");
        let signature = mapper.sign(&rule).expect("sign");
        assert!(mapper.check_signature(&rule, &signature).expect("check"));

        rule.name = "lint-all".into();
        assert!(!mapper.check_signature(&rule, &signature).expect("check"));
    }

    #[test]
    fn hashed_and_dated_fields_are_covered() {
        let mapper = mapper();
        let mut rule = Rule::sample("lint");
        let signature = mapper.sign(&rule).expect("sign");

        rule.pattern.push('x');
        assert!(!mapper.check_signature(&rule, &signature).expect("pattern"));

        let mut rule = Rule::sample("lint");
        rule.created = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().expect("date");
        assert!(!mapper.check_signature(&rule, &signature).expect("created"));
    }

    #[test]
    fn sub_second_changes_are_outside_the_canonical_form() {
        let mapper = mapper();
        let mut rule = Rule::sample("lint");
        let signature = mapper.sign(&rule).expect("sign");
        rule.created += chrono::Duration::milliseconds(250);
        assert!(mapper.check_signature(&rule, &signature).expect("check"));
    }

    #[test]
    fn garbage_signature_is_a_mismatch_not_an_error() {
        let mapper = mapper();
        let rule = Rule::sample("lint");
        assert!(!mapper.check_signature(&rule, b"garbage").expect("check"));
        assert!(!mapper.check_signature(&rule, &[]).expect("check"));
    }

    #[test]
    fn signatures_from_another_key_do_not_verify() {
        let rule = Rule::sample("lint");
        let signature = mapper_with_keys(&[7], &[1]).sign(&rule).expect("sign");
        assert!(!mapper().check_signature(&rule, &signature).expect("check"));
    }

    #[test]
    fn canonical_bytes_follow_newest_form() {
        let mapper = mapper();
        let rule = Rule::sample("lint");
        let bytes = String::from_utf8(mapper.canonical_bytes(&rule).expect("bytes")).expect("utf-8");
        assert!(bytes.starts_with(&format!("{}lint", rule.id)));
        assert!(bytes.ends_with("Z"));
    }

    #[test]
    fn db_sign_stores_signature_and_signer() {
        let mapper = mapper();
        let mut db = memory_db();
        let mut cred = Credential::sample("alice");
        mapper.insert(&mut db, &mut cred).expect("insert");

        let rows = SqlExecutor::query(
            &mut db,
            "SELECT sig, signer FROM credential WHERE id = ?1",
            &[SqlValue::Text(cred.id.clone())],
        )
        .expect("select");
        let signature = rows[0].get("sig").and_then(SqlValue::as_blob).expect("sig");
        assert!(mapper.check_signature(&cred, signature).expect("check"));

        let signer = rows[0].get("signer").map(SqlValue::to_text).expect("signer");
        let mapping = mapper.registry().get::<Credential>().expect("mapping");
        assert_eq!(signer, mapping.templates()[0].signer());
    }

    #[test]
    fn db_sign_requires_an_existing_row() {
        let mapper = mapper();
        let mut db = memory_db();
        let cred = Credential::sample("nobody");
        let err = mapper.db_sign(&mut db, &cred).unwrap_err();
        assert!(matches!(err, RowguardError::UnexpectedRowCount { actual: 0, .. }));
    }

    #[test]
    fn rotated_signing_key_still_verifies_old_rows() {
        let mut db = memory_db();
        let mut rule = Rule::sample("lint");
        mapper_with_keys(&[1], &[1])
            .insert(&mut db, &mut rule)
            .expect("insert");

        let rotated = mapper_with_keys(&[1, 2], &[1]);
        let loaded: Option<Rule> = rotated
            .get(
                &mut db,
                &Query::new("SELECT * FROM rule WHERE id = ?1").arg(rule.id),
                crate::dao::GetOptions::default(),
            )
            .expect("get");
        assert_eq!(loaded, Some(rule));
    }

    #[test]
    fn unsigned_entity_has_no_signing_template() {
        let mapper = mapper();
        let mapping = mapper.registry().get::<Counter>().expect("mapping");
        assert!(signing_template(mapping).is_err());
    }
}
