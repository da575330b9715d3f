// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for the AEAD keyring, integrity hashing and the
// rotation audit trail in the rowguard-security crate.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use rowguard_core::Keyring;
use rowguard_security::{AeadKeyring, RotationAudit, hash_bytes};

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn keyring() -> AeadKeyring {
    let raw = AeadKeyring::generate_key().expect("generate key");
    let old = AeadKeyring::generate_key().expect("generate key");
    AeadKeyring::new("bench")
        .with_key(1, &old)
        .and_then(|k| k.with_key(2, &raw))
        .expect("build keyring")
}

/// Encrypt-then-decrypt of a 1 KiB field with two AAD extras, the shape of a
/// typical encrypted column bound to its primary key.
fn bench_encrypt_decrypt_roundtrip(c: &mut Criterion) {
    let keyring = keyring();
    let plaintext = vec![0x42u8; 1024];
    let extra = vec![b"\"42\"".to_vec(), b"\"owner\"".to_vec()];

    c.bench_function("aead_roundtrip (1 KiB, 2 extras)", |b| {
        b.iter(|| {
            let ciphertext = keyring
                .encrypt(black_box(&plaintext), &extra)
                .expect("encrypt failed");
            let decrypted = keyring.decrypt(&ciphertext, &extra).expect("decrypt failed");
            black_box(decrypted);
        });
    });
}

/// SHA-256 fingerprints at sizes ranging from a short template to a large
/// JSON column.
fn bench_integrity_hash(c: &mut Criterion) {
    let sizes: &[(&str, usize)] = &[
        ("64 B", 64),
        ("1 KiB", 1024),
        ("64 KiB", 64 * 1024),
    ];

    let mut group = c.benchmark_group("integrity_hash_sha256");
    for &(label, size) in sizes {
        let data = vec![0xABu8; size];
        group.bench_function(label, |b| {
            b.iter(|| black_box(hash_bytes(black_box(&data))));
        });
    }
    group.finish();
}

/// Steady-state insertion into an in-memory rotation audit.
fn bench_audit_record(c: &mut Criterion) {
    c.bench_function("rotation_audit_record (in-memory SQLite)", |b| {
        let audit = RotationAudit::open_in_memory().expect("open in-memory audit");

        b.iter(|| {
            audit
                .record(
                    black_box("workflow"),
                    black_box("42"),
                    black_box("roll_signed"),
                    Some(2),
                    true,
                    None,
                )
                .expect("record failed");
        });
    });
}

criterion_group!(
    benches,
    bench_encrypt_decrypt_roundtrip,
    bench_integrity_hash,
    bench_audit_record
);
criterion_main!(benches);
