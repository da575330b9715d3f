// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types: encrypted field values and the reports produced by the
// administrative tooling.

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;

/// Value shown in place of an encrypted field that was not decrypted.
pub const PLACEHOLDER: &str = "**********";

// ---------------------------------------------------------------------------
// Encrypted field values
// ---------------------------------------------------------------------------

/// An encrypted field as seen in memory.
///
/// Persisted values always come back `Masked` unless decryption was
/// requested. Writing a `Masked` value never overwrites the stored secret:
/// the mapper reloads the persisted plaintext instead.
#[derive(Clone, PartialEq, Eq)]
pub enum Encrypted<T> {
    Masked,
    Plain(T),
}

impl<T> Encrypted<T> {
    pub fn plain(value: T) -> Self {
        Self::Plain(value)
    }

    pub fn is_masked(&self) -> bool {
        matches!(self, Self::Masked)
    }

    pub fn as_plain(&self) -> Option<&T> {
        match self {
            Self::Plain(v) => Some(v),
            Self::Masked => None,
        }
    }

    pub fn into_plain(self) -> Option<T> {
        match self {
            Self::Plain(v) => Some(v),
            Self::Masked => None,
        }
    }
}

impl<T: Default> Default for Encrypted<T> {
    fn default() -> Self {
        Self::Plain(T::default())
    }
}

impl<T> From<T> for Encrypted<T> {
    fn from(value: T) -> Self {
        Self::Plain(value)
    }
}

impl<T> std::fmt::Debug for Encrypted<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Masked => write!(f, "Masked"),
            Self::Plain(_) => write!(f, "Plain([REDACTED])"),
        }
    }
}

impl<T: Serialize> Serialize for Encrypted<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Masked => serializer.serialize_str(PLACEHOLDER),
            Self::Plain(v) => v.serialize(serializer),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Encrypted<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        if value.as_str() == Some(PLACEHOLDER) {
            return Ok(Self::Masked);
        }
        serde_json::from_value(value)
            .map(Self::Plain)
            .map_err(D::Error::custom)
    }
}

/// Type-erased access to an `Encrypted<T>` field, used by the mapper to
/// encrypt, decrypt and mask fields of arbitrary entities.
pub trait Secret {
    fn is_masked(&self) -> bool;

    /// JSON encoding of the plaintext, `None` when masked.
    fn plaintext_json(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the value with the decoded plaintext.
    fn set_plaintext_json(&mut self, json: &[u8]) -> Result<()>;

    fn mask(&mut self);
}

impl<T: Serialize + DeserializeOwned> Secret for Encrypted<T> {
    fn is_masked(&self) -> bool {
        Encrypted::is_masked(self)
    }

    fn plaintext_json(&self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Masked => Ok(None),
            Self::Plain(v) => Ok(Some(serde_json::to_vec(v)?)),
        }
    }

    fn set_plaintext_json(&mut self, json: &[u8]) -> Result<()> {
        *self = Self::Plain(serde_json::from_slice(json)?);
        Ok(())
    }

    fn mask(&mut self) {
        *self = Self::Masked;
    }
}

// ---------------------------------------------------------------------------
// Administrative reports
// ---------------------------------------------------------------------------

/// A registered entity as listed by the administrative tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub name: String,
    pub table: String,
    pub signed: bool,
    pub encrypted: bool,
}

/// How many rows of an entity were signed with one canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalFormUsage {
    /// Identifier of the canonical form stored in the `signer` column.
    pub signer: String,
    /// Template text, empty when the signer matches no registered form.
    pub template: String,
    pub count: i64,
    /// Whether this is the form used to mint new signatures.
    pub latest: bool,
}

/// Signature and encryption status of one tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleInfo {
    pub pk: String,
    pub signed: bool,
    pub encrypted: bool,
    /// Timestamp of the key that produced the stored signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_ts: Option<i64>,
    /// Timestamp of the key that produced the stored ciphertexts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_ts: Option<i64>,
}
