//! In-memory implementation of `Ledger`.
//!
//! `InMemoryLedger` is the reference implementation of the `Ledger` trait.
//! It keeps every record in a `Vec` behind a single `Mutex`; an append holds
//! the lock across tail resolution, hashing, and the push, so concurrent
//! appends are serialized and the chain cannot fork.
//!
//! Reads take the same lock only long enough to clone the requested window.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::debug;

use attest_contracts::{
    error::{AuditError, AuditResult},
    record::{AuditRecord, ChainTail, NewAuditEvent},
    verify::RecordRange,
};
use attest_core::traits::{ChainHead, Ledger};

use crate::builder::build_next;

// ── Internal mutable state ────────────────────────────────────────────────────

/// The mutable interior of an `InMemoryLedger`.
pub(crate) struct InMemoryState {
    /// All records, in sequence order.  `records[i].sequence == i + 1`.
    pub(crate) records: Vec<AuditRecord>,
}

impl ChainHead for InMemoryState {
    fn head(&self) -> AuditResult<Option<ChainTail>> {
        Ok(self.records.last().map(AuditRecord::tail))
    }
}

// ── Public ledger ─────────────────────────────────────────────────────────────

/// A process-local, append-only ledger.
///
/// Cheap to clone; clones share the same chain.
#[derive(Clone)]
pub struct InMemoryLedger {
    pub(crate) state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                records: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> AuditResult<MutexGuard<'_, InMemoryState>> {
        self.state.lock().map_err(|e| AuditError::Storage {
            reason: format!("ledger state lock poisoned: {}", e),
        })
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

// ── Ledger impl ───────────────────────────────────────────────────────────────

impl Ledger for InMemoryLedger {
    fn append(&self, event: NewAuditEvent) -> AuditResult<AuditRecord> {
        let mut state = self.lock()?;

        let record = build_next(&*state, event, Utc::now())?;
        state.records.push(record.clone());

        debug!(sequence = record.sequence, action = %record.action, "appended to in-memory ledger");
        Ok(record)
    }

    fn tail(&self) -> AuditResult<Option<ChainTail>> {
        self.lock()?.head()
    }

    fn read_range(&self, range: &RecordRange) -> AuditResult<Vec<AuditRecord>> {
        range.check()?;

        let state = self.lock()?;
        let start = range
            .from_sequence
            .map(|s| usize::try_from(s - 1).unwrap_or(usize::MAX))
            .unwrap_or(0)
            .min(state.records.len());

        let records = state.records[start..]
            .iter()
            .take_while(|r| range.to_sequence.map_or(true, |to| r.sequence <= to))
            .filter(|r| range.since.map_or(true, |since| r.created_at >= since))
            .filter(|r| match &range.workspace_id {
                Some(ws) => r.workspace_id.as_deref() == Some(ws.as_str()),
                None => true,
            })
            .take(range.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(records)
    }

    fn count(&self) -> AuditResult<u64> {
        Ok(self.lock()?.records.len() as u64)
    }
}
