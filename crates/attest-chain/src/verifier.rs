//! Chain verifier: walks a window of the ledger and localizes corruption.
//!
//! Every record is checked twice:
//!
//! 1. **Link** — its `sequence` follows the predecessor's, and its stored
//!    `previous_hash` equals the predecessor's stored `record_hash` (or the
//!    predecessor's recomputed hash when the predecessor was itself flagged,
//!    so a record whose own hash was overwritten does not also condemn its
//!    successor).
//! 2. **Hash** — `record_hash` recomputed from the canonical encoding
//!    matches the stored value.
//!
//! After each record the expected hash advances to the record's *stored*
//! `record_hash`, never the recomputed one.  One corrupted record is
//! reported once, not as an avalanche over every later record.
//!
//! A scan from the beginning of the ledger is anchored on `Digest::GENESIS`
//! and must start at sequence 1, so deleting the oldest records is caught
//! as a gap.  A stored row that no longer decodes is reported in place, with
//! no recomputed hash, and does not condemn its successor.
//!
//! The chain is global.  Recomputation always walks the unfiltered range;
//! a workspace filter only narrows the reported `invalid_records`.

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use attest_contracts::{
    error::VerificationError,
    record::{AuditRecord, Digest},
    verify::{
        DivergenceKind, RecordRange, RecordSummary, ScannedRecord, VerificationResult,
        VerifyOptions,
    },
};
use attest_core::traits::Ledger;

use crate::chain::compute_record_hash;

/// Verify a window of `ledger`.
///
/// # Errors
///
/// `VerificationError::MalformedRange` for an impossible window (e.g.
/// `limit = Some(0)`), `VerificationError::StoreUnavailable` when the
/// ledger cannot be read.  A broken chain is not an error.
pub fn verify<L: Ledger + ?Sized>(
    ledger: &L,
    options: &VerifyOptions,
) -> Result<VerificationResult, VerificationError> {
    // Never pass the workspace filter down: the chain must be recomputed
    // over the global order.
    let range = RecordRange {
        from_sequence: options.from_sequence,
        to_sequence: None,
        since: options.since,
        limit: options.limit,
        workspace_id: None,
    };
    range.check()?;

    let from_genesis =
        matches!(options.from_sequence, None | Some(1)) && options.since.is_none();
    let anchor = options
        .anchor
        .or_else(|| from_genesis.then_some(Digest::GENESIS));

    let rows = ledger.scan(&range)?;
    let entries: Vec<Entry<'_>> = rows.iter().map(Entry::scanned).collect();
    let result = check(&entries, anchor, options.workspace_id.as_deref());

    info!(
        valid = result.valid,
        records_checked = result.records_checked,
        invalid = result.invalid_records.len(),
        first_sequence = ?result.first_sequence,
        last_sequence = ?result.last_sequence,
        workspace_id = ?options.workspace_id,
        "chain verification finished"
    );

    Ok(result)
}

/// Verify an ordered slice of records, e.g. an export.
///
/// `anchor` is the expected `previous_hash` of the first record.  Without
/// one, a slice that starts at sequence 1 is anchored on `Digest::GENESIS`
/// and any other slice trusts its first record's stored `previous_hash`.
/// An anchor of `Digest::GENESIS` requires the slice to start at sequence 1.
pub fn verify_records(
    records: &[AuditRecord],
    anchor: Option<Digest>,
    workspace_id: Option<&str>,
) -> VerificationResult {
    let entries: Vec<Entry<'_>> = records.iter().map(Entry::intact).collect();
    check(&entries, anchor, workspace_id)
}

fn check(
    entries: &[Entry<'_>],
    anchor: Option<Digest>,
    workspace_id: Option<&str>,
) -> VerificationResult {
    let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
        return VerificationResult::empty();
    };

    let anchor = anchor.or((first.sequence == 1).then_some(Digest::GENESIS));

    let mut previous: Option<Predecessor> = None;
    let mut invalid: Vec<RecordSummary> = Vec::new();

    for entry in entries {
        let link = match &previous {
            None => match anchor {
                Some(a) if a.is_genesis() && entry.sequence != 1 => {
                    Some(DivergenceKind::SequenceGap)
                }
                Some(a) if entry.previous_hash != Some(a) => Some(DivergenceKind::BrokenLink),
                _ => None,
            },
            Some(p) if entry.sequence != p.sequence + 1 => Some(DivergenceKind::SequenceGap),
            Some(p) if !p.accepts(entry.previous_hash) => Some(DivergenceKind::BrokenLink),
            Some(_) => None,
        };
        let sealed = entry.computed.is_some() && entry.computed == entry.stored;
        let kind = link.or((!sealed).then_some(DivergenceKind::HashMismatch));

        if let Some(kind) = kind {
            warn!(
                sequence = entry.sequence,
                action = %entry.action,
                created_at = ?entry.created_at,
                ?kind,
                stored_hash = ?entry.stored,
                decode_error = ?entry.decode_error,
                "audit chain divergence"
            );
            invalid.push(entry.summary(kind));
        }

        previous = Some(Predecessor {
            sequence: entry.sequence,
            stored: entry.stored,
            computed: entry.computed,
        });
    }

    let valid = invalid.is_empty();
    if let Some(ws) = workspace_id {
        invalid.retain(|s| s.workspace_id.as_deref() == Some(ws));
    }

    VerificationResult {
        valid,
        records_checked: entries.len(),
        invalid_records: invalid,
        first_sequence: Some(first.sequence),
        last_sequence: Some(last.sequence),
        head_hash: last.stored,
    }
}

/// One scanned row, reduced to what the checks need.
struct Entry<'a> {
    sequence: u64,
    id: Option<Uuid>,
    action: &'a str,
    created_at: Option<DateTime<Utc>>,
    workspace_id: Option<&'a str>,
    previous_hash: Option<Digest>,
    stored: Option<Digest>,
    computed: Option<Digest>,
    decode_error: Option<&'a str>,
}

impl<'a> Entry<'a> {
    fn intact(record: &'a AuditRecord) -> Self {
        Self {
            sequence: record.sequence,
            id: Some(record.id),
            action: &record.action,
            created_at: Some(record.created_at),
            workspace_id: record.workspace_id.as_deref(),
            previous_hash: Some(record.previous_hash),
            stored: Some(record.record_hash),
            computed: compute_record_hash(record).ok(),
            decode_error: None,
        }
    }

    fn scanned(row: &'a ScannedRecord) -> Self {
        match row {
            ScannedRecord::Intact(record) => Self::intact(record),
            ScannedRecord::Unreadable(row) => Self {
                sequence: row.sequence,
                id: row.id,
                action: &row.action,
                created_at: row.created_at,
                workspace_id: row.workspace_id.as_deref(),
                previous_hash: row.previous_hash,
                stored: row.record_hash,
                computed: None,
                decode_error: Some(&row.reason),
            },
        }
    }

    fn summary(&self, kind: DivergenceKind) -> RecordSummary {
        RecordSummary {
            sequence: self.sequence,
            id: self.id,
            action: self.action.to_string(),
            created_at: self.created_at,
            workspace_id: self.workspace_id.map(str::to_string),
            kind,
            stored_hash: self.stored,
            computed_hash: self.computed,
            decode_error: self.decode_error.map(str::to_string),
        }
    }
}

/// What the next record must link to.
struct Predecessor {
    sequence: u64,
    stored: Option<Digest>,
    computed: Option<Digest>,
}

impl Predecessor {
    fn accepts(&self, previous_hash: Option<Digest>) -> bool {
        // An undecodable predecessor has already been reported; there is
        // nothing left to compare the link against.
        if self.stored.is_none() && self.computed.is_none() {
            return true;
        }
        previous_hash.is_some() && (previous_hash == self.stored || previous_hash == self.computed)
    }
}
