// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Rotating AES-256-GCM keyring.
//
// Ciphertext layout:
//
//   | key timestamp (i64, BE, 8) | nonce (12) | sealed payload + tag |
//
// The timestamp selects the key version on decryption, so rows written
// under a retired key stay readable until they are rolled.

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use rowguard_core::config::KeyringConfig;
use rowguard_core::error::{Result, RowguardError};
use rowguard_core::keyring::{KeyInfo, Keyring};
use tracing::{debug, instrument};

/// Length of a raw AES-256 key.
pub const KEY_LEN: usize = 32;

const TIMESTAMP_LEN: usize = 8;
const HEADER_LEN: usize = TIMESTAMP_LEN + NONCE_LEN;

struct VersionedKey {
    timestamp: i64,
    key: LessSafeKey,
}

/// Keyring holding one or more timestamped AES-256-GCM keys.
///
/// The key with the greatest timestamp encrypts; every key can decrypt.
pub struct AeadKeyring {
    identifier: String,
    /// Sorted newest first.
    keys: Vec<VersionedKey>,
    rng: SystemRandom,
}

impl std::fmt::Debug for AeadKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadKeyring")
            .field("identifier", &self.identifier)
            .field("timestamps", &self.timestamps())
            .finish()
    }
}

impl AeadKeyring {
    /// An empty keyring; add keys with [`AeadKeyring::with_key`].
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            keys: Vec::new(),
            rng: SystemRandom::new(),
        }
    }

    /// Add a key version. Fails on a wrong key length or a duplicate timestamp.
    pub fn with_key(mut self, timestamp: i64, raw: &[u8]) -> Result<Self> {
        if raw.len() != KEY_LEN {
            return Err(RowguardError::KeyUnavailable(format!(
                "{}: key {timestamp} has {} bytes, expected {KEY_LEN}",
                self.identifier,
                raw.len()
            )));
        }
        if self.keys.iter().any(|k| k.timestamp == timestamp) {
            return Err(RowguardError::KeyUnavailable(format!(
                "{}: duplicate key timestamp {timestamp}",
                self.identifier
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, raw)
            .map_err(|_| RowguardError::KeyUnavailable("invalid key material".into()))?;
        self.keys.push(VersionedKey {
            timestamp,
            key: LessSafeKey::new(unbound),
        });
        self.keys.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(self)
    }

    /// Build a keyring from hex-encoded configuration.
    pub fn from_config(config: &KeyringConfig) -> Result<Self> {
        let mut keyring = Self::new(config.identifier.clone());
        for key in &config.keys {
            let raw = hex::decode(&key.key).map_err(|e| {
                RowguardError::KeyUnavailable(format!(
                    "{}: key {} is not hex: {e}",
                    config.identifier, key.timestamp
                ))
            })?;
            keyring = keyring.with_key(key.timestamp, &raw)?;
        }
        debug!(identifier = %config.identifier, keys = keyring.keys.len(), "keyring loaded");
        Ok(keyring)
    }

    /// Generate fresh random key material.
    pub fn generate_key() -> Result<[u8; KEY_LEN]> {
        let mut raw = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut raw)
            .map_err(|_| RowguardError::KeyUnavailable("system randomness unavailable".into()))?;
        Ok(raw)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Key timestamps, newest first.
    pub fn timestamps(&self) -> Vec<i64> {
        self.keys.iter().map(|k| k.timestamp).collect()
    }
}

/// Length-prefix each extra value so that `["ab", "c"]` and `["a", "bc"]`
/// authenticate differently.
fn encode_aad(extra: &[Vec<u8>]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(extra.iter().map(|e| e.len() + 4).sum());
    for e in extra {
        aad.extend_from_slice(&(e.len() as u32).to_be_bytes());
        aad.extend_from_slice(e);
    }
    aad
}

impl Keyring for AeadKeyring {
    #[instrument(skip_all, fields(identifier = %self.identifier, plaintext_len = plaintext.len()))]
    fn encrypt(&self, plaintext: &[u8], extra: &[Vec<u8>]) -> Result<Vec<u8>> {
        let current = self.keys.first().ok_or_else(|| {
            RowguardError::KeyUnavailable(format!("{}: keyring is empty", self.identifier))
        })?;

        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| RowguardError::Encryption("system randomness unavailable".into()))?;

        let aad = encode_aad(extra);
        let mut sealed = plaintext.to_vec();
        current
            .key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(aad.as_slice()),
                &mut sealed,
            )
            .map_err(|_| RowguardError::Encryption(format!("{}: seal failed", self.identifier)))?;

        let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
        out.extend_from_slice(&current.timestamp.to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    #[instrument(skip_all, fields(identifier = %self.identifier, ciphertext_len = ciphertext.len()))]
    fn decrypt_with_info(
        &self,
        ciphertext: &[u8],
        extra: &[Vec<u8>],
    ) -> Result<(Vec<u8>, KeyInfo)> {
        if ciphertext.len() < HEADER_LEN + AES_256_GCM.tag_len() {
            return Err(RowguardError::Decryption(format!(
                "{}: ciphertext too short ({} bytes)",
                self.identifier,
                ciphertext.len()
            )));
        }
        let (ts_bytes, rest) = ciphertext.split_at(TIMESTAMP_LEN);
        let (nonce_bytes, sealed) = rest.split_at(NONCE_LEN);

        let mut ts = [0u8; TIMESTAMP_LEN];
        ts.copy_from_slice(ts_bytes);
        let timestamp = i64::from_be_bytes(ts);

        let version = self
            .keys
            .iter()
            .find(|k| k.timestamp == timestamp)
            .ok_or_else(|| {
                RowguardError::Decryption(format!(
                    "{}: no key with timestamp {timestamp}",
                    self.identifier
                ))
            })?;

        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| RowguardError::Decryption("malformed nonce".into()))?;
        let aad = encode_aad(extra);
        let mut in_out = sealed.to_vec();
        let plaintext = version
            .key
            .open_in_place(nonce, Aad::from(aad.as_slice()), &mut in_out)
            .map_err(|_| {
                RowguardError::Decryption(format!(
                    "{}: authentication failed",
                    self.identifier
                ))
            })?;

        Ok((plaintext.to_vec(), KeyInfo { timestamp }))
    }

    fn latest(&self) -> Result<KeyInfo> {
        self.keys
            .first()
            .map(|k| KeyInfo {
                timestamp: k.timestamp,
            })
            .ok_or_else(|| {
                RowguardError::KeyUnavailable(format!("{}: keyring is empty", self.identifier))
            })
    }
}
