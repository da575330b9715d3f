// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Rotation audit trail: append-only SQLite log of every tuple rolled to a
// new signing or encryption key.
//
// Schema:
//   rotation_audit(
//     id            INTEGER PRIMARY KEY AUTOINCREMENT,
//     timestamp     TEXT    NOT NULL,   -- RFC 3339
//     entity        TEXT    NOT NULL,   -- registered entity name
//     pk            TEXT    NOT NULL,   -- primary key, as text
//     action        TEXT    NOT NULL,   -- "roll_signed", "roll_encrypted"
//     key_timestamp INTEGER,            -- key the tuple was rolled to
//     success       INTEGER NOT NULL,   -- 0 = failure, 1 = success
//     details       TEXT                -- optional free-form context
//   )

use std::path::Path;

use chrono::Utc;
use rowguard_core::error::{Result, RowguardError};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const CREATE_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS rotation_audit (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp     TEXT    NOT NULL,
        entity        TEXT    NOT NULL,
        pk            TEXT    NOT NULL,
        action        TEXT    NOT NULL,
        key_timestamp INTEGER,
        success       INTEGER NOT NULL,
        details       TEXT
    );";

fn db_err(e: rusqlite::Error) -> RowguardError {
    RowguardError::Database(e.to_string())
}

/// A single entry in the rotation audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationEntry {
    pub id: i64,
    pub timestamp: String,
    pub entity: String,
    pub pk: String,
    pub action: String,
    pub key_timestamp: Option<i64>,
    pub success: bool,
    pub details: Option<String>,
}

/// Append-only audit trail of key rotation work, backed by SQLite.
pub struct RotationAudit {
    conn: Connection,
}

impl RotationAudit {
    /// Open (or create) the audit database at `path` in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("rotation audit opened");
        Ok(Self { conn })
    }

    /// Open an in-memory audit database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;
        Ok(Self { conn })
    }

    /// Record the outcome of rolling one tuple.
    #[instrument(skip(self, details), fields(%entity, %pk, %action, success))]
    pub fn record(
        &self,
        entity: &str,
        pk: &str,
        action: &str,
        key_timestamp: Option<i64>,
        success: bool,
        details: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO rotation_audit
                 (timestamp, entity, pk, action, key_timestamp, success, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Utc::now().to_rfc3339(),
                    entity,
                    pk,
                    action,
                    key_timestamp,
                    i32::from(success),
                    details
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// All entries for one entity, oldest first.
    pub fn entries_for_entity(&self, entity: &str) -> Result<Vec<RotationEntry>> {
        self.select(
            "SELECT id, timestamp, entity, pk, action, key_timestamp, success, details
             FROM rotation_audit WHERE entity = ?1 ORDER BY id ASC",
            params![entity],
        )
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent_entries(&self, limit: u32) -> Result<Vec<RotationEntry>> {
        self.select(
            "SELECT id, timestamp, entity, pk, action, key_timestamp, success, details
             FROM rotation_audit ORDER BY id DESC LIMIT ?1",
            params![limit],
        )
    }

    pub fn count(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM rotation_audit", [], |row| row.get(0))
            .map_err(db_err)
    }

    fn select(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<RotationEntry>> {
        let mut stmt = self.conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(RotationEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    entity: row.get(2)?,
                    pk: row.get(3)?,
                    action: row.get(4)?,
                    key_timestamp: row.get(5)?,
                    success: row.get::<_, i32>(6)? != 0,
                    details: row.get(7)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }
}
