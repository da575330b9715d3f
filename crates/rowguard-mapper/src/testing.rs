// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared fixtures for the mapper tests: one entity per capability
// (plain, encrypted, signed, signed and encrypted) and their SQLite schema.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rowguard_core::config::{ENCRYPTION_KEY_IDENTIFIER, SIGNATURE_KEY_IDENTIFIER};
use rowguard_core::types::{Encrypted, Secret};
use rowguard_security::{AeadKeyring, hash_bytes};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::CanonicalForms;
use crate::dao::Mapper;
use crate::entity::{ColumnKind, Entity, Field, Signed};
use crate::registry::{Registry, Table};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS counter (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    label   TEXT NOT NULL UNIQUE CHECK (length(label) <= 32),
    enabled INTEGER NOT NULL,
    meta    TEXT
);

CREATE TABLE IF NOT EXISTS vault_item (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    cipher_secret BLOB
);

CREATE TABLE IF NOT EXISTS rule (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    name    TEXT NOT NULL,
    pattern TEXT NOT NULL,
    created TEXT NOT NULL,
    sig     BLOB,
    signer  TEXT
);

CREATE TABLE IF NOT EXISTS credential (
    id            TEXT PRIMARY KEY,
    owner         TEXT NOT NULL,
    created       TEXT NOT NULL,
    updated       TEXT NOT NULL,
    cipher_token  BLOB,
    cipher_config BLOB,
    sig           BLOB,
    signer        TEXT
);
";

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Plain entity with a generated key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Counter {
    pub id: i64,
    pub label: String,
    pub enabled: bool,
    pub meta: Value,
}

impl Entity for Counter {
    const NAME: &'static str = "counter";

    fn fields() -> Vec<Field> {
        vec![
            Field::column("id", ColumnKind::Integer),
            Field::column("label", ColumnKind::Text),
            Field::column("enabled", ColumnKind::Bool),
            Field::column("meta", ColumnKind::Json),
        ]
    }
}

/// Encrypted, unsigned entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct VaultItem {
    pub id: i64,
    pub name: String,
    pub secret: Encrypted<String>,
}

impl Entity for VaultItem {
    const NAME: &'static str = "vault_item";

    fn fields() -> Vec<Field> {
        vec![
            Field::column("id", ColumnKind::Integer),
            Field::column("name", ColumnKind::Text),
            Field::encrypted("secret", "cipher_secret", &["id"]),
        ]
    }

    fn secrets(&self) -> Vec<(&'static str, &dyn Secret)> {
        vec![("secret", &self.secret)]
    }

    fn secrets_mut(&mut self) -> Vec<(&'static str, &mut dyn Secret)> {
        vec![("secret", &mut self.secret)]
    }
}

/// Signed entity with two canonical forms, the older one still on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Rule {
    pub id: i64,
    pub name: String,
    pub pattern: String,
    pub created: DateTime<Utc>,
}

impl Rule {
    pub fn sample(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_owned(),
            pattern: format!("^{name}/.*$"),
            created: Utc
                .with_ymd_and_hms(2026, 1, 15, 10, 30, 0)
                .single()
                .expect("valid date"),
        }
    }
}

impl Entity for Rule {
    const NAME: &'static str = "rule";

    fn fields() -> Vec<Field> {
        vec![
            Field::column("id", ColumnKind::Integer),
            Field::column("name", ColumnKind::Text),
            Field::column("pattern", ColumnKind::Text),
            Field::column("created", ColumnKind::Text),
        ]
    }
}

impl Signed for Rule {
    fn canonical_forms() -> CanonicalForms {
        CanonicalForms::new([
            "{{.id}}{{.name}}{{hash .pattern}}{{date .created}}",
            "{{.id}}{{.name}}",
        ])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Stamps {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Stamps {
    fn fields() -> Vec<Field> {
        vec![
            Field::column("created", ColumnKind::Text),
            Field::column("updated", ColumnKind::Text),
        ]
    }
}

/// Signed and encrypted entity with a caller-chosen text key and embedded
/// timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Credential {
    pub id: String,
    pub owner: String,
    #[serde(flatten)]
    pub stamps: Stamps,
    pub token: Encrypted<String>,
    pub config: Encrypted<BTreeMap<String, String>>,
}

impl Credential {
    pub fn sample(owner: &str) -> Self {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 1, 8, 0, 0)
            .single()
            .expect("valid date");
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.to_owned(),
            stamps: Stamps {
                created: now,
                updated: now,
            },
            token: Encrypted::plain(format!("token-{owner}")),
            config: Encrypted::plain(BTreeMap::from([("owner".to_owned(), owner.to_owned())])),
        }
    }
}

impl Entity for Credential {
    const NAME: &'static str = "credential";

    fn fields() -> Vec<Field> {
        vec![
            Field::column("id", ColumnKind::Text),
            Field::column("owner", ColumnKind::Text),
            Field::embedded(Stamps::fields),
            Field::encrypted("token", "cipher_token", &["id", "owner"]),
            Field::encrypted("config", "cipher_config", &["id"]),
        ]
    }

    fn secrets(&self) -> Vec<(&'static str, &dyn Secret)> {
        vec![("token", &self.token), ("config", &self.config)]
    }

    fn secrets_mut(&mut self) -> Vec<(&'static str, &mut dyn Secret)> {
        vec![("token", &mut self.token), ("config", &mut self.config)]
    }
}

impl Signed for Credential {
    fn canonical_forms() -> CanonicalForms {
        CanonicalForms::new(["{{.id}}{{.owner}}{{date .created}}"])
    }
}

// ---------------------------------------------------------------------------
// Registry, keys and databases
// ---------------------------------------------------------------------------

pub(crate) fn registry() -> Registry {
    let mut builder = Registry::builder();
    builder
        .register::<Counter>(Table::new("counter", "id").auto_increment())
        .expect("counter");
    builder
        .register::<VaultItem>(Table::new("vault_item", "id").auto_increment())
        .expect("vault item");
    builder
        .register_signed::<Rule>(Table::new("rule", "id").auto_increment())
        .expect("rule");
    builder
        .register_signed::<Credential>(Table::new("credential", "id"))
        .expect("credential");
    builder.build()
}

/// Deterministic key material: the same identifier and timestamp always
/// yield the same key, so separately built mappers share keys.
fn keyring(identifier: &str, timestamps: &[i64]) -> AeadKeyring {
    timestamps
        .iter()
        .fold(AeadKeyring::new(identifier), |ring, &ts| {
            let digest = hash_bytes(format!("{identifier}:{ts}").as_bytes());
            ring.with_key(ts, &digest.as_bytes()[..32]).expect("key")
        })
}

pub(crate) fn signature_key(timestamps: &[i64]) -> AeadKeyring {
    keyring(SIGNATURE_KEY_IDENTIFIER, timestamps)
}

pub(crate) fn mapper_with_keys(signature: &[i64], encryption: &[i64]) -> Mapper {
    Mapper::new(
        registry(),
        Arc::new(signature_key(signature)),
        Arc::new(keyring(ENCRYPTION_KEY_IDENTIFIER, encryption)),
    )
}

pub(crate) fn mapper() -> Mapper {
    mapper_with_keys(&[1], &[1])
}

pub(crate) fn mapper_without_registrations() -> Mapper {
    Mapper::new(
        Registry::builder().build(),
        Arc::new(signature_key(&[1])),
        Arc::new(keyring(ENCRYPTION_KEY_IDENTIFIER, &[1])),
    )
}

pub(crate) fn memory_db() -> Connection {
    let conn = Connection::open_in_memory().expect("open");
    conn.execute_batch(SCHEMA).expect("schema");
    conn
}

/// A connection to a database file shared by every call with the same `dir`.
pub(crate) fn file_db(dir: &Path) -> Connection {
    let conn = Connection::open(dir.join("rowguard.db")).expect("open");
    conn.execute_batch(SCHEMA).expect("schema");
    conn
}

/// Corrupt the stored signature of one row.
pub(crate) fn flip_signature_byte(db: &Connection, table: &str, pk: &str) {
    let mut sig: Vec<u8> = db
        .query_row(
            &format!("SELECT sig FROM {table} WHERE CAST(id AS TEXT) = ?1"),
            [pk],
            |row| row.get(0),
        )
        .expect("signature");
    let last = sig.len() - 1;
    sig[last] ^= 0x01;
    db.execute(
        &format!("UPDATE {table} SET sig = ?1 WHERE CAST(id AS TEXT) = ?2"),
        rusqlite::params![sig, pk],
    )
    .expect("flip");
}
