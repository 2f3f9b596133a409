//! `AuditTrail`: the two operations a host application consumes.
//!
//! - `record` — append one event; retried on `AppendConflict`.
//! - `verify` — run the chain verifier, read-only and idempotent.
//!
//! `record_throttled` adds the host-side deduplication of noisy events
//! (repeated document views and the like).  It runs before the ledger is
//! touched; the ledger contract itself never drops an append.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use attest_contracts::{
    error::{AuditError, AuditResult, VerificationError},
    record::{AuditRecord, NewAuditEvent},
    verify::{VerificationResult, VerifyOptions},
};
use attest_core::{config::AttestConfig, traits::Ledger};

use crate::verifier;

/// Identity of an event for deduplication purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    workspace_id: Option<String>,
    actor_id: Option<String>,
    action: String,
    resource_type: Option<String>,
    resource_id: Option<String>,
}

impl DedupKey {
    fn of(event: &NewAuditEvent) -> Self {
        Self {
            workspace_id: event.workspace_id.clone(),
            actor_id: event.actor_id.clone(),
            action: event.action.clone(),
            resource_type: event.resource_type.clone(),
            resource_id: event.resource_id.clone(),
        }
    }
}

/// Prune the dedup table once it grows past this many keys.
const DEDUP_PRUNE_THRESHOLD: usize = 4096;

/// Host-facing audit service over any `Ledger`.
pub struct AuditTrail {
    ledger: Arc<dyn Ledger>,
    config: AttestConfig,
    recent: Mutex<HashMap<DedupKey, Instant>>,
}

impl AuditTrail {
    pub fn new(ledger: Arc<dyn Ledger>, config: AttestConfig) -> Self {
        Self {
            ledger,
            config,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn config(&self) -> &AttestConfig {
        &self.config
    }

    /// Append `event` to the chain.
    ///
    /// An `AppendConflict` retries the whole append (the ledger re-resolves
    /// the tail each time) up to `append.max_retries` extra attempts.  Every
    /// other error, and the last conflict, propagates to the caller.
    pub fn record(&self, event: NewAuditEvent) -> AuditResult<AuditRecord> {
        let max_retries = self.config.append.max_retries;
        let mut attempt = 0u32;

        loop {
            match self.ledger.append(event.clone()) {
                Err(AuditError::AppendConflict { reason }) if attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        action = %event.action,
                        attempt,
                        max_retries,
                        %reason,
                        "append conflict; retrying"
                    );
                }
                other => return other,
            }
        }
    }

    /// Append `event` unless an identical one was recorded within the
    /// configured dedup window.
    ///
    /// Only actions listed in `dedup.actions` are subject to suppression.
    /// Returns `Ok(None)` when the event was skipped.
    pub fn record_throttled(&self, event: NewAuditEvent) -> AuditResult<Option<AuditRecord>> {
        let dedup = &self.config.dedup;
        if dedup.window_secs == 0 || !dedup.actions.iter().any(|a| *a == event.action) {
            return self.record(event).map(Some);
        }

        let window = Duration::from_secs(dedup.window_secs);
        let key = DedupKey::of(&event);
        let now = Instant::now();

        // Reserve the slot before appending so concurrent duplicates see it.
        let previous = {
            let mut recent = self.lock_recent()?;
            if let Some(last) = recent.get(&key) {
                if now.duration_since(*last) < window {
                    debug!(action = %event.action, actor_id = ?event.actor_id, "duplicate event suppressed");
                    return Ok(None);
                }
            }
            if recent.len() >= DEDUP_PRUNE_THRESHOLD {
                recent.retain(|_, seen| now.duration_since(*seen) < window);
            }
            recent.insert(key.clone(), now)
        };

        match self.record(event) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // The append never happened; release the reservation.
                let mut recent = self.lock_recent()?;
                match previous {
                    Some(seen) => recent.insert(key, seen),
                    None => recent.remove(&key),
                };
                Err(e)
            }
        }
    }

    /// Verify the chain, reporting divergences for `workspace_id` only.
    ///
    /// Applies `verify.default_limit` when `limit` is `None`.
    pub fn verify(
        &self,
        workspace_id: Option<String>,
        limit: Option<usize>,
    ) -> Result<VerificationResult, VerificationError> {
        self.verify_with(&VerifyOptions {
            workspace_id,
            limit: limit.or(self.config.verify.default_limit),
            ..VerifyOptions::default()
        })
    }

    /// Verify the chain with full control over the scan window.
    pub fn verify_with(&self, options: &VerifyOptions) -> Result<VerificationResult, VerificationError> {
        verifier::verify(self.ledger.as_ref(), options)
    }

    fn lock_recent(&self) -> AuditResult<std::sync::MutexGuard<'_, HashMap<DedupKey, Instant>>> {
        self.recent.lock().map_err(|e| AuditError::Storage {
            reason: format!("dedup table lock poisoned: {}", e),
        })
    }
}
