// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Keyring contract: the only component allowed to know about cipher
// algorithms and key rotation.

use crate::error::Result;

/// Which key version satisfied a decrypt call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyInfo {
    pub timestamp: i64,
}

/// A possibly rotating set of symmetric keys.
///
/// `extra` values are bound as additional authenticated data: decrypting
/// with a different `extra` list must fail. Implementations must be safe to
/// share between threads.
pub trait Keyring: Send + Sync {
    /// Encrypt with the newest key.
    fn encrypt(&self, plaintext: &[u8], extra: &[Vec<u8>]) -> Result<Vec<u8>>;

    /// Decrypt with whichever key version produced `ciphertext`, and report it.
    fn decrypt_with_info(&self, ciphertext: &[u8], extra: &[Vec<u8>])
    -> Result<(Vec<u8>, KeyInfo)>;

    fn decrypt(&self, ciphertext: &[u8], extra: &[Vec<u8>]) -> Result<Vec<u8>> {
        self.decrypt_with_info(ciphertext, extra)
            .map(|(plaintext, _)| plaintext)
    }

    /// Timestamp of the key used by `encrypt`.
    fn latest(&self) -> Result<KeyInfo>;
}
