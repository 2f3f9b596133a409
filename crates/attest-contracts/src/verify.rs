//! Read windows, verification options, and verification reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{AuditError, AuditResult},
    record::{AuditRecord, Digest},
};

/// A window over the ledger, in ascending `sequence` order.
///
/// All bounds are optional.  `workspace_id` narrows the result for display;
/// a workspace-filtered window cannot be chain-verified on its own because
/// other workspaces' records are interleaved in the global order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordRange {
    /// Inclusive lower bound.  Sequences start at 1.
    pub from_sequence: Option<u64>,
    /// Inclusive upper bound.
    pub to_sequence: Option<u64>,
    /// Only records created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of records returned.
    pub limit: Option<usize>,
    pub workspace_id: Option<String>,
}

impl RecordRange {
    /// The whole ledger, unfiltered.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_sequence(mut self, sequence: u64) -> Self {
        self.from_sequence = Some(sequence);
        self
    }

    pub fn to_sequence(mut self, sequence: u64) -> Self {
        self.to_sequence = Some(sequence);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    /// Reject windows no store could satisfy.
    ///
    /// # Errors
    ///
    /// `AuditError::InvalidRange` naming the offending bound.
    pub fn check(&self) -> AuditResult<()> {
        if self.from_sequence == Some(0) {
            return Err(invalid_range(
                "sequences start at 1; from_sequence 0 is not addressable".to_string(),
            ));
        }
        if let (Some(from), Some(to)) = (self.from_sequence, self.to_sequence) {
            if from > to {
                return Err(invalid_range(format!(
                    "from_sequence {from} is after to_sequence {to}"
                )));
            }
        }
        if self.limit == Some(0) {
            return Err(invalid_range("limit must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn invalid_range(reason: String) -> AuditError {
    AuditError::InvalidRange { reason }
}

/// A stored row as seen by a verification scan.
///
/// Rows whose stored text no longer decodes are still part of the chain;
/// the verifier reports them instead of aborting the scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScannedRecord {
    Intact(AuditRecord),
    Unreadable(UnreadableRecord),
}

impl ScannedRecord {
    pub fn sequence(&self) -> u64 {
        match self {
            ScannedRecord::Intact(record) => record.sequence,
            ScannedRecord::Unreadable(row) => row.sequence,
        }
    }
}

/// Whatever could still be decoded from a damaged row.
#[derive(Debug, Clone, PartialEq)]
pub struct UnreadableRecord {
    pub sequence: u64,
    pub id: Option<Uuid>,
    pub action: String,
    pub created_at: Option<DateTime<Utc>>,
    pub workspace_id: Option<String>,
    pub previous_hash: Option<Digest>,
    pub record_hash: Option<Digest>,
    /// Which columns failed to decode, and why.
    pub reason: String,
}

/// Options for a chain verification scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyOptions {
    /// Start the scan at this sequence instead of the genesis record.
    pub from_sequence: Option<u64>,
    /// Start the scan at the first record created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of records scanned.
    pub limit: Option<usize>,
    /// Expected `previous_hash` of the first scanned record.  When absent, a
    /// scan from the beginning of the ledger (no `from_sequence` past 1, no
    /// `since`) anchors on `Digest::GENESIS` and must start at sequence 1;
    /// any other scan trusts the first record's stored `previous_hash`.
    pub anchor: Option<Digest>,
    /// Restricts `invalid_records` in the report.  Never restricts which
    /// records are recomputed, and never affects `valid`.
    pub workspace_id: Option<String>,
}

/// How a record diverged from the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// The stored `record_hash` does not match the recomputed digest.
    HashMismatch,
    /// The stored `previous_hash` does not match the predecessor's hash.
    BrokenLink,
    /// The record's `sequence` does not follow its predecessor's.
    SequenceGap,
}

/// Enough information for an operator to locate a divergent record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub sequence: u64,
    /// `None` only for rows whose stored id no longer decodes, as are
    /// `created_at` and `stored_hash`.
    pub id: Option<Uuid>,
    pub action: String,
    pub created_at: Option<DateTime<Utc>>,
    pub workspace_id: Option<String>,
    pub kind: DivergenceKind,
    pub stored_hash: Option<Digest>,
    /// The digest recomputed from the chain, when one could be computed.
    pub computed_hash: Option<Digest>,
    /// Set when the stored row itself could not be decoded.
    pub decode_error: Option<String>,
}

/// The outcome of a verification scan that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// True when every record in the scanned global range verified,
    /// regardless of any workspace filter on the report.
    pub valid: bool,
    pub records_checked: usize,
    /// Divergent records, restricted to the requested workspace if any.
    pub invalid_records: Vec<RecordSummary>,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    /// Stored `record_hash` of the last scanned record.  Usable as the
    /// anchor for a later scan that continues from here.
    pub head_hash: Option<Digest>,
}

impl VerificationResult {
    /// The result for a scan that found no records.
    pub fn empty() -> Self {
        Self {
            valid: true,
            records_checked: 0,
            invalid_records: Vec::new(),
            first_sequence: None,
            last_sequence: None,
            head_hash: None,
        }
    }
}
