// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Rowguard.

use thiserror::Error;

/// Top-level error type for all Rowguard operations.
#[derive(Debug, Error)]
pub enum RowguardError {
    // -- Registration errors (fatal at start-up) --
    #[error("cannot register entity {entity}: {reason}")]
    Registration { entity: String, reason: String },

    #[error("canonical form error: {0}")]
    CanonicalForm(String),

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    // -- Storage --
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tuple is locked: {0}")]
    Locked(String),

    #[error("expected {expected} affected row(s), got {actual}: {query}")]
    UnexpectedRowCount {
        query: String,
        expected: u64,
        actual: u64,
    },

    #[error("database error: {0}")]
    Database(String),

    // -- Crypto --
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    // -- Plumbing --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RowguardError {
    /// Build a registration error for the named entity.
    pub fn registration(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Registration {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is the first-class "absent" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the error is row-lock contention; callers may retry or skip.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RowguardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_variants() {
        assert!(RowguardError::NotFound("x".into()).is_not_found());
        assert!(!RowguardError::NotFound("x".into()).is_locked());
        assert!(RowguardError::Locked("t:1".into()).is_locked());
        assert!(!RowguardError::Database("boom".into()).is_not_found());
    }

    #[test]
    fn row_count_message_names_query() {
        let err = RowguardError::UnexpectedRowCount {
            query: "UPDATE t SET sig = ?1".into(),
            expected: 1,
            actual: 0,
        };
        assert_eq!(
            err.to_string(),
            "expected 1 affected row(s), got 0: UPDATE t SET sig = ?1"
        );
    }
}
