// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Rowguard: Core types, storage contracts and error definitions shared
// across all crates.

pub mod config;
pub mod error;
pub mod keyring;
pub mod sql;
pub mod sqlite;
pub mod types;

pub use config::{KeyConfig, KeyringConfig, MapperConfig};
pub use error::{Result, RowguardError};
pub use keyring::{KeyInfo, Keyring};
pub use sql::{Dialect, Query, Row, SqlExecutor, SqlValue, StorageErrorKind};
pub use types::*;
