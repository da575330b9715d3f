// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sealed key files: the mapper configuration (signature and encryption key
// material) stored as an age file encrypted with a passphrase (scrypt), so
// keys never rest on disk in clear.

use std::io::{Read, Write};
use std::path::Path;

use age::secrecy::SecretString;
use rowguard_core::config::MapperConfig;
use rowguard_core::error::{Result, RowguardError};
use tracing::{debug, info, instrument};

/// Passphrase-sealed storage for key material.
///
/// The passphrase is held only for the lifetime of the `SealedKeyFile` value
/// so that callers can drop it promptly after the keyrings are built.
pub struct SealedKeyFile {
    /// The operator passphrase wrapped in a `SecretString` so that it is
    /// zeroised on drop.
    passphrase: SecretString,
}

impl SealedKeyFile {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: SecretString::from(passphrase.into()),
        }
    }

    /// Seal `plaintext` into a complete age file (header + payload).
    #[instrument(skip_all, fields(plaintext_len = plaintext.len()))]
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let encryptor = age::Encryptor::with_user_passphrase(self.passphrase.clone());
        let mut sealed = Vec::new();

        let mut writer = encryptor
            .wrap_output(&mut sealed)
            .map_err(|e| RowguardError::Encryption(e.to_string()))?;
        writer
            .write_all(plaintext)
            .map_err(|e| RowguardError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| RowguardError::Encryption(e.to_string()))?;

        debug!(sealed_len = sealed.len(), "key material sealed");
        Ok(sealed)
    }

    /// Open a complete age file produced by [`SealedKeyFile::seal`].
    #[instrument(skip_all, fields(sealed_len = sealed.len()))]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let decryptor =
            age::Decryptor::new(sealed).map_err(|e| RowguardError::Decryption(e.to_string()))?;
        let identity = age::scrypt::Identity::new(self.passphrase.clone());

        let mut reader = decryptor
            .decrypt(std::iter::once(&identity as &dyn age::Identity))
            .map_err(|e| RowguardError::Decryption(e.to_string()))?;

        let mut plaintext = Vec::new();
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| RowguardError::Decryption(e.to_string()))?;
        Ok(plaintext)
    }

    /// Write `config` to `path` as a sealed file.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn store_config(&self, path: impl AsRef<Path>, config: &MapperConfig) -> Result<()> {
        let sealed = self.seal(&config.to_json()?)?;
        std::fs::write(path.as_ref(), sealed)?;
        info!("sealed key file written");
        Ok(())
    }

    /// Read and unseal the configuration stored at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load_config(&self, path: impl AsRef<Path>) -> Result<MapperConfig> {
        let sealed = std::fs::read(path.as_ref())?;
        let config = MapperConfig::from_json(&self.open(&sealed)?)?;
        info!(
            signature_keys = config.signature.keys.len(),
            encryption_keys = config.encryption.keys.len(),
            "sealed key file loaded"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowguard_core::config::KeyringConfig;

    #[test]
    fn seal_round_trip() {
        let file = SealedKeyFile::new("correct-horse-battery-staple");
        let sealed = file.seal(b"key material").expect("seal failed");
        assert!(!sealed.windows(12).any(|w| w == b"key material"));

        let opened = file.open(&sealed).expect("open failed");
        assert_eq!(opened, b"key material");
    }

    #[test]
    fn wrong_passphrase_fails() {
        let sealed = SealedKeyFile::new("passphrase-alpha")
            .seal(b"secret")
            .expect("seal failed");
        let result = SealedKeyFile::new("passphrase-beta").open(&sealed);
        assert!(
            matches!(result, Err(RowguardError::Decryption(_))),
            "opening with the wrong passphrase must fail"
        );
    }

    #[test]
    fn config_survives_disk_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys.age");
        let config = MapperConfig {
            signature: KeyringConfig::new("db-sig").with_key(1, "aa".repeat(32)),
            encryption: KeyringConfig::new("db-crypt").with_key(2, "bb".repeat(32)),
        };

        let file = SealedKeyFile::new("operator");
        file.store_config(&path, &config).expect("store");

        let raw = std::fs::read(&path).expect("read");
        assert!(!raw.windows(8).any(|w| w == b"db-crypt"));

        assert_eq!(file.load_config(&path).expect("load"), config);
    }
}
