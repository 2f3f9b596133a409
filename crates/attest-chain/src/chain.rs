//! Hash engine: the SHA-256 link between consecutive records.
//!
//! Hash input layout (bytes, in order):
//!   1. previous_hash as 32 raw bytes (`Digest::GENESIS` for the first record)
//!   2. canonical payload from `encode::encode`
//!
//! Fields are never hashed separately and then combined; the single
//! concatenated input is what prevents reordering.

use sha2::{Digest as _, Sha256};

use attest_contracts::{
    error::AuditResult,
    record::{AuditRecord, Digest},
};

use crate::encode::encode;

/// Digest `previous_hash ‖ payload`.
pub fn hash_record(previous_hash: &Digest, payload: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(payload);

    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Digest(out)
}

/// Recompute `record.record_hash` from its own `previous_hash` and fields.
///
/// The stored `record_hash` is ignored.
pub fn compute_record_hash(record: &AuditRecord) -> AuditResult<Digest> {
    let payload = encode(record)?;
    Ok(hash_record(&record.previous_hash, &payload))
}
