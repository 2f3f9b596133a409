//! Chain builder: turns a caller's event into the next sealed record.
//!
//! The builder never writes.  A ledger calls it from inside its append
//! critical section, passing the `ChainHead` view it already holds, and
//! persists the returned record in the same atomic unit.

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use attest_contracts::{
    error::{AuditError, AuditResult},
    record::{canonical_timestamp, AuditRecord, Digest, NewAuditEvent},
};
use attest_core::traits::ChainHead;

use crate::chain::compute_record_hash;

/// Build the record that follows the current head.
///
/// - `sequence` is the tail's plus one, or 1 for an empty chain.
/// - `previous_hash` is the tail's `record_hash`, or `Digest::GENESIS`.
/// - `created_at` is `now` truncated to microseconds, clamped so it never
///   precedes the tail's timestamp.
///
/// # Errors
///
/// Propagates the head's error, and `AuditError::Encoding` when the event
/// cannot be canonically encoded.  No partially hashed record is returned.
pub fn build_next<H: ChainHead + ?Sized>(
    head: &H,
    event: NewAuditEvent,
    now: DateTime<Utc>,
) -> AuditResult<AuditRecord> {
    let tail = head.head()?;

    let (sequence, previous_hash, created_at) = match tail {
        Some(tail) => {
            let sequence = tail.sequence.checked_add(1).ok_or_else(|| AuditError::Storage {
                reason: "sequence space exhausted".to_string(),
            })?;
            let created_at = canonical_timestamp(now).max(tail.created_at);
            (sequence, tail.record_hash, created_at)
        }
        None => (1, Digest::GENESIS, canonical_timestamp(now)),
    };

    let mut record = AuditRecord {
        sequence,
        id: Uuid::new_v4(),
        workspace_id: event.workspace_id,
        actor_id: event.actor_id,
        impersonating_actor_id: event.impersonating_actor_id,
        action: event.action,
        resource_type: event.resource_type,
        resource_id: event.resource_id,
        details: event.details,
        ip_address: event.ip_address,
        user_agent: event.user_agent,
        created_at,
        previous_hash,
        record_hash: Digest::GENESIS, // sealed below
    };
    record.record_hash = compute_record_hash(&record)?;

    debug!(
        sequence = record.sequence,
        action = %record.action,
        previous_hash = %record.previous_hash,
        record_hash = %record.record_hash,
        "built next chain record"
    );

    Ok(record)
}
