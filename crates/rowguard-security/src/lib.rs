// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! rowguard-security: Key material and integrity primitives for the mapper.
//!
//! This crate provides the concrete keyring behind the signature and
//! field-encryption protocols (AES-256-GCM with timestamped key versions),
//! SHA-256 fingerprints used by canonical forms, passphrase-sealed key files,
//! and an append-only audit trail of key rotation work.

pub mod audit;
pub mod integrity;
pub mod keyring;
pub mod sealed;

// PUBLIC API: Re-export security primitives
pub use audit::{RotationAudit, RotationEntry};
pub use integrity::{canonical_json, hash_bytes, hash_json};
pub use keyring::AeadKeyring;
pub use sealed::SealedKeyFile;
