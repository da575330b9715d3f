// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Storage contract: dynamically typed SQL values, result rows, query
// objects and the executor trait every backing store implements.

use std::borrow::Cow;

use crate::error::{Result, RowguardError};

// ---------------------------------------------------------------------------
// Values and rows
// ---------------------------------------------------------------------------

/// A single SQL value, bound as a parameter or read from a result column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Textual rendering used to compare primary keys of heterogeneous types.
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Integer(i) => i.to_string(),
            Self::Real(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// One result row: column names paired with their values, in select order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Value of the named column.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    /// Value at the given position.
    pub fn get_index(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    /// Remove the named column from the row and return its value.
    pub fn take(&mut self, column: &str) -> Option<SqlValue> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.columns.remove(idx);
        Some(self.values.remove(idx))
    }

    pub fn into_pairs(self) -> impl Iterator<Item = (String, SqlValue)> {
        self.columns.into_iter().zip(self.values)
    }
}

// ---------------------------------------------------------------------------
// Query object
// ---------------------------------------------------------------------------

/// Raw query text, positional arguments and an optional row limit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    sql: String,
    args: Vec<SqlValue>,
    limit: Option<u64>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
            limit: None,
        }
    }

    /// Append one positional argument.
    pub fn arg(mut self, value: impl Into<SqlValue>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Replace the positional arguments.
    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        self.args = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query text with the limit clause applied.
    pub fn sql(&self) -> Cow<'_, str> {
        match self.limit {
            Some(limit) => Cow::Owned(format!("{} LIMIT {limit}", self.sql)),
            None => Cow::Borrowed(&self.sql),
        }
    }

    pub fn arguments(&self) -> &[SqlValue] {
        &self.args
    }
}

// ---------------------------------------------------------------------------
// Dialects
// ---------------------------------------------------------------------------

/// SQL dialect of an executor. Only parameter binding, textual key
/// comparison and row locking differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Positional placeholder for the 1-based parameter `n`.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Self::Sqlite => format!("?{n}"),
            Self::Postgres => format!("${n}"),
        }
    }

    /// `column` compared as text with parameter `n`.
    pub fn text_eq(self, column: &str, n: usize) -> String {
        match self {
            Self::Sqlite => format!("CAST({column} AS TEXT) = CAST(?{n} AS TEXT)"),
            Self::Postgres => format!("{column}::text = ${n}::text"),
        }
    }

    /// `column` (as text) is a member of the JSON string array bound to `n`.
    pub fn text_in_json_array(self, column: &str, n: usize) -> String {
        match self {
            Self::Sqlite => {
                format!("CAST({column} AS TEXT) IN (SELECT value FROM json_each(?{n}))")
            }
            Self::Postgres => {
                format!("{column}::text = ANY(ARRAY(SELECT json_array_elements_text(${n}::json)))")
            }
        }
    }

    /// Row-lock clause appended to a point select, if the dialect has one.
    pub fn lock_clause(self) -> &'static str {
        match self {
            Self::Sqlite => "",
            Self::Postgres => " FOR UPDATE NOWAIT",
        }
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Classification of a native storage error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Unique or primary key violation.
    Conflict,
    /// Value too long, check or not-null violation.
    InvalidData,
    /// Lock could not be acquired without waiting.
    Locked,
    Other,
}

impl StorageErrorKind {
    /// Classify a PostgreSQL SQLSTATE code.
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "23505" => Self::Conflict,
            "22001" | "23502" | "23514" => Self::InvalidData,
            "55P03" => Self::Locked,
            _ => Self::Other,
        }
    }

    pub fn into_error(self, message: impl Into<String>) -> RowguardError {
        let message = message.into();
        match self {
            Self::Conflict => RowguardError::Conflict(message),
            Self::InvalidData => RowguardError::InvalidData(message),
            Self::Locked => RowguardError::Locked(message),
            Self::Other => RowguardError::Database(message),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// A database handle or open transaction. Every mapper operation runs
/// synchronously inside the executor it is given.
pub trait SqlExecutor {
    fn dialect(&self) -> Dialect;

    /// Run a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64>;

    /// Run a query and collect every row.
    fn query(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>>;
}
