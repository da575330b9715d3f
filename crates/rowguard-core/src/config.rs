// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Mapper configuration: key material for the signature and encryption
// keyrings.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default identifier of the keyring used to sign canonical forms.
pub const SIGNATURE_KEY_IDENTIFIER: &str = "db-sig";

/// Default identifier of the keyring used for field-level encryption.
pub const ENCRYPTION_KEY_IDENTIFIER: &str = "db-crypt";

/// One versioned key. `key` is the hex encoding of 32 raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Version of the key, conventionally the Unix time it was minted.
    pub timestamp: i64,
    pub key: String,
}

/// A named set of keys. The key with the greatest timestamp is the active one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringConfig {
    pub identifier: String,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

impl KeyringConfig {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            keys: Vec::new(),
        }
    }

    /// Add a key version.
    pub fn with_key(mut self, timestamp: i64, key_hex: impl Into<String>) -> Self {
        self.keys.push(KeyConfig {
            timestamp,
            key: key_hex.into(),
        });
        self
    }
}

/// Persistent mapper settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperConfig {
    /// Keys used to sign the canonical form of signed entities.
    pub signature: KeyringConfig,
    /// Keys used to encrypt annotated fields.
    pub encryption: KeyringConfig,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            signature: KeyringConfig::new(SIGNATURE_KEY_IDENTIFIER),
            encryption: KeyringConfig::new(ENCRYPTION_KEY_IDENTIFIER),
        }
    }
}

impl MapperConfig {
    /// Parse a configuration from its JSON representation.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(json)?)
    }

    /// Read a plain JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_json(&bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}
