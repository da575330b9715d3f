// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SQLite executor backed by rusqlite connections and transactions.

use crate::error::{Result, RowguardError};
use crate::sql::{Dialect, Row, SqlExecutor, SqlValue, StorageErrorKind};
use rusqlite::types::{ToSqlOutput, Value as NativeValue, ValueRef};
use rusqlite::{Connection, ErrorCode, ToSql, Transaction, ffi, params_from_iter};
use tracing::trace;

/// Borrowed parameter binding for a [`SqlValue`].
struct Bind<'a>(&'a SqlValue);

impl ToSql for Bind<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            SqlValue::Null => ToSqlOutput::Owned(NativeValue::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(NativeValue::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(NativeValue::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

/// Map a native SQLite error onto the domain error kinds.
fn db_err(e: rusqlite::Error) -> RowguardError {
    let kind = match &e {
        rusqlite::Error::SqliteFailure(native, _) => match native.code {
            ErrorCode::ConstraintViolation => match native.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    StorageErrorKind::Conflict
                }
                _ => StorageErrorKind::InvalidData,
            },
            ErrorCode::TooBig => StorageErrorKind::InvalidData,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StorageErrorKind::Locked,
            _ => StorageErrorKind::Other,
        },
        _ => StorageErrorKind::Other,
    };
    kind.into_error(e.to_string())
}

fn execute_on(conn: &Connection, sql: &str, args: &[SqlValue]) -> Result<u64> {
    trace!(%sql, args = args.len(), "execute");
    let affected = conn
        .execute(sql, params_from_iter(args.iter().map(Bind)))
        .map_err(db_err)?;
    Ok(affected as u64)
}

fn query_on(conn: &Connection, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>> {
    trace!(%sql, args = args.len(), "query");
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt
        .query(params_from_iter(args.iter().map(Bind)))
        .map_err(db_err)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(db_err)? {
        let values = (0..columns.len())
            .map(|idx| row.get_ref(idx).map(from_value_ref))
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        out.push(Row::new(columns.clone(), values));
    }
    Ok(out)
}

impl SqlExecutor for Connection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64> {
        execute_on(self, sql, args)
    }

    fn query(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>> {
        query_on(self, sql, args)
    }
}

impl SqlExecutor for Transaction<'_> {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64> {
        execute_on(self, sql, args)
    }

    fn query(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>> {
        query_on(self, sql, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE,
                             data BLOB, CHECK (length(name) <= 8));",
        )
        .expect("schema");
        conn
    }

    #[test]
    fn executes_and_queries_with_typed_values() {
        let mut conn = db();
        let n = SqlExecutor::execute(
            &mut conn,
            "INSERT INTO t (id, name, data) VALUES (?1, ?2, ?3)",
            &[SqlValue::Integer(1), "one".into(), vec![0u8, 1].into()],
        )
        .expect("insert");
        assert_eq!(n, 1);

        let rows = SqlExecutor::query(&mut conn, "SELECT id, name, data FROM t", &[])
            .expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&SqlValue::Integer(1)));
        assert_eq!(rows[0].get("name"), Some(&SqlValue::Text("one".into())));
        assert_eq!(rows[0].get("data"), Some(&SqlValue::Blob(vec![0, 1])));
    }

    #[test]
    fn constraint_violations_are_classified() {
        let mut conn = db();
        let insert = "INSERT INTO t (id, name) VALUES (?1, ?2)";
        SqlExecutor::execute(&mut conn, insert, &[SqlValue::Integer(1), "a".into()]).expect("insert");

        let dup = SqlExecutor::execute(&mut conn, insert, &[SqlValue::Integer(2), "a".into()]).unwrap_err();
        assert!(matches!(dup, RowguardError::Conflict(_)));

        let too_long =
            SqlExecutor::execute(&mut conn, insert, &[SqlValue::Integer(3), "abcdefghij".into()]).unwrap_err();
        assert!(matches!(too_long, RowguardError::InvalidData(_)));

        let null = SqlExecutor::execute(&mut conn, insert, &[SqlValue::Integer(4), SqlValue::Null])
            .unwrap_err();
        assert!(matches!(null, RowguardError::InvalidData(_)));
    }

    #[test]
    fn transactions_execute_statements() {
        let mut conn = db();
        let mut tx = conn.transaction().expect("begin");
        SqlExecutor::execute(&mut tx, "INSERT INTO t (id, name) VALUES (1, 'x')", &[])
            .expect("insert");
        assert_eq!(tx.dialect(), Dialect::Sqlite);
        tx.commit().expect("commit");

        let rows = SqlExecutor::query(&mut conn, "SELECT name FROM t", &[]).expect("select");
        assert_eq!(rows[0].get_index(0), Some(&SqlValue::Text("x".into())));
    }
}
