//! Trait seams between the hash chain and its storage.
//!
//! - `Ledger`    — the append-only store.  The only write is `append`.
//! - `ChainHead` — the tail of the chain as seen from *inside* an append's
//!   critical section, so the chain builder can resolve `previous_hash`
//!   without a second, racy read.
//!
//! Neither trait offers update, delete, or upsert.  Immutability of stored
//! records is a property of the contract itself: there is no code path to
//! rewrite history.

use attest_contracts::{
    error::AuditResult,
    record::{AuditRecord, ChainTail, NewAuditEvent},
    verify::{RecordRange, ScannedRecord},
};

/// The append-only audit ledger.
///
/// Implementations must be safe to share across threads.  Concurrent
/// `append` calls must be serialized with respect to tail resolution: two
/// appends must never read the same tail and both link to it.
pub trait Ledger: Send + Sync {
    /// Append one record to the global chain.
    ///
    /// Assigns `sequence`, `id`, and `created_at`, resolves the current
    /// tail, computes `record_hash`, and persists the record atomically.
    ///
    /// # Errors
    ///
    /// - `AuditError::AppendConflict` when the write lost a race; retry the
    ///   whole call.
    /// - `AuditError::Encoding` when the event cannot be canonically encoded.
    /// - `AuditError::Storage` when the backing store fails.
    fn append(&self, event: NewAuditEvent) -> AuditResult<AuditRecord>;

    /// The newest committed record, or `None` for an empty ledger.
    fn tail(&self) -> AuditResult<Option<ChainTail>>;

    /// Committed records within `range`, ascending by `sequence`.
    ///
    /// Never returns a partially written record.
    fn read_range(&self, range: &RecordRange) -> AuditResult<Vec<AuditRecord>>;

    /// Like `read_range`, but a stored row that no longer decodes is
    /// returned as `ScannedRecord::Unreadable` instead of failing the read.
    ///
    /// Stores that cannot hold undecodable rows keep the default.
    fn scan(&self, range: &RecordRange) -> AuditResult<Vec<ScannedRecord>> {
        Ok(self
            .read_range(range)?
            .into_iter()
            .map(ScannedRecord::Intact)
            .collect())
    }

    /// Number of committed records.
    fn count(&self) -> AuditResult<u64>;
}

/// Read access to the chain tail while an append holds the write side.
pub trait ChainHead {
    fn head(&self) -> AuditResult<Option<ChainTail>>;
}

impl ChainHead for Option<ChainTail> {
    fn head(&self) -> AuditResult<Option<ChainTail>> {
        Ok(*self)
    }
}
