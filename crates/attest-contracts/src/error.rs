//! Error types for the attest ledger.
//!
//! Two channels are kept apart on purpose: `AuditError` covers the write
//! path and general ledger access, `VerificationError` covers the cases
//! where a verification scan could not be carried out at all.  A chain that
//! was checked and found broken is neither; it is a `VerificationResult`
//! with `valid = false`.

use thiserror::Error;

/// The unified error type for ledger operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Two appends raced for the same chain tail and this one lost.
    ///
    /// The caller must retry the whole append (re-resolve the tail and
    /// recompute the hash); the stale `previous_hash` must never be reused.
    #[error("append conflict: {reason}")]
    AppendConflict { reason: String },

    /// A field could not be canonically encoded.
    ///
    /// Fatal to that single append.  Nothing is written.
    #[error("encoding error: {reason}")]
    Encoding { reason: String },

    /// The backing store failed or refused the operation.
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// A read range was malformed (e.g. `from > to`, or a zero limit).
    #[error("invalid range: {reason}")]
    InvalidRange { reason: String },

    /// A required configuration value is missing or invalid.
    #[error("configuration error: {reason}")]
    Config { reason: String },
}

/// Convenience alias used throughout the attest crates.
pub type AuditResult<T> = Result<T, AuditError>;

/// Infrastructure failure during a verification scan.
///
/// Never mapped to `valid: true` or `valid: false`: the caller learns that
/// the chain could not be checked, not that it is broken.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The ledger could not be read.
    #[error("ledger unavailable during verification: {reason}")]
    StoreUnavailable { reason: String },

    /// The requested scan window is malformed.
    #[error("malformed verification range: {reason}")]
    MalformedRange { reason: String },
}

impl From<AuditError> for VerificationError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::InvalidRange { reason } => VerificationError::MalformedRange { reason },
            other => VerificationError::StoreUnavailable {
                reason: other.to_string(),
            },
        }
    }
}
