//! # attest-chain
//!
//! Append-only, SHA-256 hash-chained audit ledger.
//!
//! ## Overview
//!
//! Every event a host application records becomes an `AuditRecord` whose
//! `record_hash` covers its canonical encoding and the previous record's
//! hash.  There is one global chain; tampering with any stored record (a
//! field, a hash, or a link) is detected and localized by `verify`.
//!
//! - `encode`   — canonical, order-independent byte encoding
//! - `chain`    — the hash engine, `SHA256(previous_hash ‖ payload)`
//! - `builder`  — resolves the tail and seals the next record
//! - `verifier` — walks a window and reports each divergent record once
//! - `memory`   — the reference in-memory `Ledger`
//! - `service`  — `AuditTrail`, the host-facing Record / Verify operations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use attest_chain::{AuditTrail, InMemoryLedger};
//! use attest_contracts::record::NewAuditEvent;
//!
//! let trail = AuditTrail::new(Arc::new(InMemoryLedger::new()), Default::default());
//! trail.record(NewAuditEvent::new("auth.login").actor("user-1"))?;
//!
//! let report = trail.verify(None, None)?;
//! assert!(report.valid);
//! ```

pub mod builder;
pub mod chain;
pub mod encode;
pub mod memory;
pub mod service;
pub mod verifier;

pub use builder::build_next;
pub use chain::{compute_record_hash, hash_record};
pub use encode::{canonical_json, encode};
pub use memory::InMemoryLedger;
pub use service::AuditTrail;
pub use verifier::{verify, verify_records};

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use sha2::{Digest as _, Sha256};
    use uuid::Uuid;

    use attest_contracts::{
        error::{AuditError, AuditResult, VerificationError},
        record::{AuditRecord, ChainTail, Digest, NewAuditEvent},
        verify::{DivergenceKind, RecordRange, VerifyOptions},
    };
    use attest_core::{config::AttestConfig, traits::Ledger};

    use super::*;

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn event(action: &str, workspace: &str) -> NewAuditEvent {
        NewAuditEvent::new(action)
            .workspace(workspace)
            .actor("user-7")
            .resource("document", "doc-42")
            .detail("field", "title")
            .unwrap()
    }

    fn ledger_with(n: usize) -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        for i in 0..n {
            ledger
                .append(event("document.update", if i % 2 == 0 { "ws-a" } else { "ws-b" }))
                .unwrap();
        }
        ledger
    }

    fn fixed_record(details: serde_json::Value) -> AuditRecord {
        let details = match details {
            serde_json::Value::Object(map) => map,
            _ => panic!("details must be an object"),
        };
        AuditRecord {
            sequence: 3,
            id: Uuid::nil(),
            workspace_id: Some("ws-a".to_string()),
            actor_id: Some("user-7".to_string()),
            impersonating_actor_id: None,
            action: "admin.update_credentials".to_string(),
            resource_type: Some("user".to_string()),
            resource_id: None,
            details,
            ip_address: None,
            user_agent: Some("curl/8".to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            previous_hash: Digest::GENESIS,
            record_hash: Digest::GENESIS,
        }
    }

    // ── Canonical encoder ─────────────────────────────────────────────────────

    /// The payload layout is positional and fixed.
    #[test]
    fn test_encoding_layout() {
        let bytes = encode(&fixed_record(json!({"b": [1, {"y": null, "x": true}], "a": "q\"\n"})))
            .unwrap();
        let expected = concat!(
            r#"["attest.v1",3,"00000000-0000-0000-0000-000000000000","2024-05-01T12:00:00.000000Z","#,
            r#""ws-a","user-7",null,"admin.update_credentials","user",null,"#,
            r#"{"a":"q\"\u000a","b":[1,{"x":true,"y":null}]},null,"curl/8"]"#,
        );
        assert_eq!(String::from_utf8(bytes).unwrap(), expected);
    }

    /// Key insertion order in `details` never changes the bytes or the hash.
    #[test]
    fn test_encoding_determinism() {
        let mut one = fixed_record(json!({}));
        one.details.insert("zeta".into(), json!(1));
        one.details.insert("alpha".into(), json!({"k2": 2, "k1": 1}));

        let mut two = fixed_record(json!({}));
        two.details.insert("alpha".into(), json!({"k1": 1, "k2": 2}));
        two.details.insert("zeta".into(), json!(1));

        assert_eq!(encode(&one).unwrap(), encode(&two).unwrap());
        assert_eq!(compute_record_hash(&one).unwrap(), compute_record_hash(&two).unwrap());
    }

    /// An explicit null and an absent key must never collide.
    #[test]
    fn test_null_and_absent_do_not_collide() {
        let with_null = fixed_record(json!({"x": null}));
        let empty = fixed_record(json!({}));
        assert_ne!(encode(&with_null).unwrap(), encode(&empty).unwrap());

        let mut no_ip = fixed_record(json!({}));
        no_ip.ip_address = None;
        let mut empty_ip = fixed_record(json!({}));
        empty_ip.ip_address = Some(String::new());
        assert_ne!(encode(&no_ip).unwrap(), encode(&empty_ip).unwrap());
    }

    #[test]
    fn test_encoding_rejects_bad_action() {
        let mut record = fixed_record(json!({}));
        record.action = String::new();
        assert!(matches!(encode(&record), Err(AuditError::Encoding { .. })));

        record.action = "document view".to_string();
        assert!(matches!(encode(&record), Err(AuditError::Encoding { .. })));
    }

    // ── Hash engine ───────────────────────────────────────────────────────────

    /// The digest is SHA-256 over the raw previous hash followed by the payload.
    #[test]
    fn test_hash_is_sha256_of_concatenation() {
        let previous = Digest([7; 32]);
        let payload = b"payload";

        let mut hasher = Sha256::new();
        hasher.update([7u8; 32]);
        hasher.update(payload);
        let expected = hex_of(&hasher.finalize());

        assert_eq!(hash_record(&previous, payload).to_hex(), expected);
        assert_ne!(hash_record(&Digest::GENESIS, payload), hash_record(&previous, payload));
    }

    fn hex_of(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    // ── Chain builder ─────────────────────────────────────────────────────────

    #[test]
    fn test_builder_starts_at_genesis() {
        let now = Utc::now();
        let record = build_next(&None::<ChainTail>, event("auth.login", "ws-a"), now).unwrap();
        assert_eq!(record.sequence, 1);
        assert_eq!(record.previous_hash, Digest::GENESIS);
        assert_eq!(record.record_hash, compute_record_hash(&record).unwrap());
    }

    /// A clock that steps backwards never produces a decreasing `created_at`.
    #[test]
    fn test_builder_clamps_created_at_to_tail() {
        let tail = ChainTail {
            sequence: 9,
            record_hash: Digest([3; 32]),
            created_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        };
        let record = build_next(&Some(tail), event("auth.login", "ws-a"), Utc::now()).unwrap();
        assert_eq!(record.sequence, 10);
        assert_eq!(record.previous_hash, Digest([3; 32]));
        assert_eq!(record.created_at, tail.created_at);
    }

    // ── Ledger ────────────────────────────────────────────────────────────────

    /// Each record links to its predecessor; only the first links to genesis.
    #[test]
    fn test_append_links_records() {
        let ledger = ledger_with(4);
        let records = ledger.read_range(&RecordRange::all()).unwrap();

        assert_eq!(records.len(), 4);
        assert_eq!(records[0].previous_hash, Digest::GENESIS);
        for pair in records.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            assert_eq!(pair[1].previous_hash, pair[0].record_hash);
            assert!(pair[1].created_at >= pair[0].created_at);
        }
        assert_eq!(
            records.iter().filter(|r| r.previous_hash.is_genesis()).count(),
            1
        );
        assert_eq!(ledger.tail().unwrap().unwrap().sequence, 4);
        assert_eq!(ledger.count().unwrap(), 4);
    }

    /// A failed encoding leaves the ledger untouched.
    #[test]
    fn test_encoding_error_writes_nothing() {
        let ledger = ledger_with(2);
        let err = ledger.append(NewAuditEvent::new("")).unwrap_err();
        assert!(matches!(err, AuditError::Encoding { .. }));
        assert_eq!(ledger.count().unwrap(), 2);
        assert!(verify(&ledger, &VerifyOptions::default()).unwrap().valid);
    }

    #[test]
    fn test_read_range_windows() {
        let ledger = ledger_with(6);

        let mid = ledger
            .read_range(&RecordRange::all().from_sequence(2).to_sequence(4))
            .unwrap();
        assert_eq!(mid.iter().map(|r| r.sequence).collect::<Vec<_>>(), [2, 3, 4]);

        let ws_b = ledger.read_range(&RecordRange::all().workspace("ws-b")).unwrap();
        assert_eq!(ws_b.iter().map(|r| r.sequence).collect::<Vec<_>>(), [2, 4, 6]);

        let limited = ledger.read_range(&RecordRange::all().from_sequence(5).limit(10)).unwrap();
        assert_eq!(limited.len(), 2);

        let past_end = ledger.read_range(&RecordRange::all().from_sequence(50)).unwrap();
        assert!(past_end.is_empty());

        let err = ledger.read_range(&RecordRange::all().limit(0)).unwrap_err();
        assert!(matches!(err, AuditError::InvalidRange { .. }));
    }

    /// Ten concurrent appends produce ten distinct, gapless sequences and a
    /// chain that still verifies.
    #[test]
    fn test_concurrent_appends_do_not_fork() {
        let ledger = Arc::new(InMemoryLedger::new());

        std::thread::scope(|scope| {
            for i in 0..10 {
                let ledger = Arc::clone(&ledger);
                scope.spawn(move || {
                    ledger.append(event("auth.login", &format!("ws-{i}"))).unwrap();
                });
            }
        });

        let records = ledger.read_range(&RecordRange::all()).unwrap();
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, (1..=10).collect::<Vec<u64>>());

        let report = verify(ledger.as_ref(), &VerifyOptions::default()).unwrap();
        assert!(report.valid);
        assert_eq!(report.records_checked, 10);
    }

    // ── Chain verifier ────────────────────────────────────────────────────────

    #[test]
    fn test_verify_empty_ledger() {
        let report = verify(&InMemoryLedger::new(), &VerifyOptions::default()).unwrap();
        assert!(report.valid);
        assert_eq!(report.records_checked, 0);
        assert!(report.invalid_records.is_empty());
        assert_eq!(report.head_hash, None);
    }

    #[test]
    fn test_verify_round_trip() {
        let ledger = ledger_with(25);
        let report = verify(&ledger, &VerifyOptions::default()).unwrap();

        assert!(report.valid);
        assert_eq!(report.records_checked, 25);
        assert!(report.invalid_records.is_empty());
        assert_eq!(report.first_sequence, Some(1));
        assert_eq!(report.last_sequence, Some(25));
        assert_eq!(report.head_hash, Some(ledger.tail().unwrap().unwrap().record_hash));
    }

    /// Overwriting one stored hash is reported exactly once, at that record.
    #[test]
    fn test_single_point_hash_corruption() {
        let ledger = ledger_with(6);
        {
            let mut state = ledger.state.lock().unwrap();
            state.records[2].record_hash = Digest([0xee; 32]);
        }

        let report = verify(&ledger, &VerifyOptions::default()).unwrap();
        assert!(!report.valid);
        assert_eq!(report.records_checked, 6);
        assert_eq!(report.invalid_records.len(), 1, "{:?}", report.invalid_records);
        assert_eq!(report.invalid_records[0].sequence, 3);
        assert_eq!(report.invalid_records[0].kind, DivergenceKind::HashMismatch);
        assert_eq!(report.invalid_records[0].stored_hash, Some(Digest([0xee; 32])));
        assert!(report.invalid_records[0].computed_hash.is_some());
    }

    /// Editing a field without touching any hash is localized to that record.
    #[test]
    fn test_field_tampering_detected() {
        let ledger = ledger_with(5);
        {
            let mut state = ledger.state.lock().unwrap();
            state.records[3].action = "document.delete".to_string();
        }

        let report = verify(&ledger, &VerifyOptions::default()).unwrap();
        assert!(!report.valid);
        assert_eq!(report.invalid_records.len(), 1);
        assert_eq!(report.invalid_records[0].sequence, 4);
        assert_eq!(report.invalid_records[0].action, "document.delete");
    }

    /// A rewritten link is caught even though the record's own hash ignores
    /// which predecessor it claims.
    #[test]
    fn test_broken_link_detected() {
        let ledger = ledger_with(4);
        {
            let mut state = ledger.state.lock().unwrap();
            state.records[1].previous_hash = Digest([1; 32]);
        }

        let report = verify(&ledger, &VerifyOptions::default()).unwrap();
        assert!(!report.valid);
        assert_eq!(report.invalid_records.len(), 1);
        assert_eq!(report.invalid_records[0].sequence, 2);
        assert_eq!(report.invalid_records[0].kind, DivergenceKind::BrokenLink);
    }

    /// A removed record shows up as a gap at its successor.
    #[test]
    fn test_deleted_record_detected() {
        let ledger = ledger_with(5);
        let records: Vec<AuditRecord> = {
            let state = ledger.state.lock().unwrap();
            state
                .records
                .iter()
                .filter(|r| r.sequence != 3)
                .cloned()
                .collect()
        };

        let report = verify_records(&records, None, None);
        assert!(!report.valid);
        assert_eq!(report.records_checked, 4);
        assert_eq!(report.invalid_records.len(), 1);
        assert_eq!(report.invalid_records[0].sequence, 4);
        assert_eq!(report.invalid_records[0].kind, DivergenceKind::SequenceGap);
    }

    /// Workspace filtering narrows the report but never the validity verdict.
    #[test]
    fn test_workspace_filter_affects_report_only() {
        let ledger = ledger_with(6); // odd sequences in ws-a, even in ws-b
        {
            let mut state = ledger.state.lock().unwrap();
            state.records[2].record_hash = Digest([0xaa; 32]); // sequence 3, ws-a
        }

        let for_b = verify(
            &ledger,
            &VerifyOptions {
                workspace_id: Some("ws-b".to_string()),
                ..VerifyOptions::default()
            },
        )
        .unwrap();
        assert!(!for_b.valid, "global chain is broken");
        assert!(for_b.invalid_records.is_empty(), "ws-b has no broken records");
        assert_eq!(for_b.records_checked, 6, "recomputation walks the global range");

        let for_a = verify(
            &ledger,
            &VerifyOptions {
                workspace_id: Some("ws-a".to_string()),
                ..VerifyOptions::default()
            },
        )
        .unwrap();
        assert_eq!(for_a.invalid_records.len(), 1);
        assert_eq!(for_a.invalid_records[0].sequence, 3);
    }

    /// A scan that starts mid-chain trusts the first record's stored link,
    /// unless an explicit anchor is supplied.
    #[test]
    fn test_bounded_scan_anchoring() {
        let ledger = ledger_with(8);

        let window = VerifyOptions {
            from_sequence: Some(4),
            limit: Some(3),
            ..VerifyOptions::default()
        };
        let report = verify(&ledger, &window).unwrap();
        assert!(report.valid);
        assert_eq!(report.records_checked, 3);
        assert_eq!(report.first_sequence, Some(4));
        assert_eq!(report.last_sequence, Some(6));

        // Continuing from the previous head verifies the next window.
        let next = VerifyOptions {
            from_sequence: Some(7),
            anchor: report.head_hash,
            ..VerifyOptions::default()
        };
        assert!(verify(&ledger, &next).unwrap().valid);

        // A wrong anchor flags the first record of the window.
        let wrong = VerifyOptions {
            from_sequence: Some(7),
            anchor: Some(Digest([9; 32])),
            ..VerifyOptions::default()
        };
        let report = verify(&ledger, &wrong).unwrap();
        assert!(!report.valid);
        assert_eq!(report.invalid_records[0].sequence, 7);
        assert_eq!(report.invalid_records[0].kind, DivergenceKind::BrokenLink);
    }

    /// The genesis record is held to the published sentinel, not trusted.
    #[test]
    fn test_genesis_link_enforced() {
        let ledger = ledger_with(3);
        {
            let mut state = ledger.state.lock().unwrap();
            state.records[0].previous_hash = Digest([5; 32]);
        }
        let report = verify(&ledger, &VerifyOptions::default()).unwrap();
        assert!(!report.valid);
        assert_eq!(report.invalid_records.len(), 1);
        assert_eq!(report.invalid_records[0].sequence, 1);
    }

    /// Dropping the oldest records cannot pass as a shorter chain: a scan
    /// from the beginning must start at sequence 1.
    #[test]
    fn test_truncated_prefix_detected() {
        let ledger = ledger_with(5);
        {
            let mut state = ledger.state.lock().unwrap();
            state.records.drain(..2);
        }

        let report = verify(&ledger, &VerifyOptions::default()).unwrap();
        assert!(!report.valid);
        assert_eq!(report.records_checked, 3);
        assert_eq!(report.first_sequence, Some(3));
        assert_eq!(report.invalid_records.len(), 1, "{:?}", report.invalid_records);
        assert_eq!(report.invalid_records[0].sequence, 3);
        assert_eq!(report.invalid_records[0].kind, DivergenceKind::SequenceGap);

        // The same slice offline: implicit trust, explicit genesis anchor.
        let survivors = ledger.read_range(&RecordRange::all()).unwrap();
        assert!(verify_records(&survivors, None, None).valid);
        let anchored = verify_records(&survivors, Some(Digest::GENESIS), None);
        assert_eq!(anchored.invalid_records[0].kind, DivergenceKind::SequenceGap);
    }

    /// Chains can be recomputed from raw records alone.
    #[test]
    fn test_chain_recomputable_from_exported_records() {
        let ledger = ledger_with(5);
        let exported =
            serde_json::to_string(&ledger.read_range(&RecordRange::all()).unwrap()).unwrap();
        let imported: Vec<AuditRecord> = serde_json::from_str(&exported).unwrap();

        let report = verify_records(&imported, None, None);
        assert!(report.valid);
        assert_eq!(report.records_checked, 5);
    }

    #[test]
    fn test_zero_limit_is_malformed_range() {
        let err = verify(
            &ledger_with(1),
            &VerifyOptions {
                limit: Some(0),
                ..VerifyOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, VerificationError::MalformedRange { .. }));
    }

    /// A ledger that cannot be read is an error, never a verdict.
    #[test]
    fn test_unreadable_ledger_is_verification_error() {
        let err = verify(&FlakyLedger::failing_reads(), &VerifyOptions::default()).unwrap_err();
        assert!(matches!(err, VerificationError::StoreUnavailable { .. }));
    }

    // ── AuditTrail ────────────────────────────────────────────────────────────

    /// A ledger that reports `AppendConflict` a fixed number of times before
    /// delegating to an in-memory ledger.
    struct FlakyLedger {
        inner: InMemoryLedger,
        conflicts_left: AtomicU32,
        fail_reads: bool,
    }

    impl FlakyLedger {
        fn with_conflicts(n: u32) -> Self {
            Self {
                inner: InMemoryLedger::new(),
                conflicts_left: AtomicU32::new(n),
                fail_reads: false,
            }
        }

        fn failing_reads() -> Self {
            Self {
                fail_reads: true,
                ..Self::with_conflicts(0)
            }
        }
    }

    impl Ledger for FlakyLedger {
        fn append(&self, event: NewAuditEvent) -> AuditResult<AuditRecord> {
            if self
                .conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AuditError::AppendConflict {
                    reason: "tail moved".to_string(),
                });
            }
            self.inner.append(event)
        }

        fn tail(&self) -> AuditResult<Option<ChainTail>> {
            self.inner.tail()
        }

        fn read_range(&self, range: &RecordRange) -> AuditResult<Vec<AuditRecord>> {
            if self.fail_reads {
                return Err(AuditError::Storage {
                    reason: "database is unreachable".to_string(),
                });
            }
            self.inner.read_range(range)
        }

        fn count(&self) -> AuditResult<u64> {
            self.inner.count()
        }
    }

    #[test]
    fn test_record_retries_append_conflicts() {
        let trail = AuditTrail::new(Arc::new(FlakyLedger::with_conflicts(2)), AttestConfig::default());
        let record = trail.record(event("auth.login", "ws-a")).unwrap();
        assert_eq!(record.sequence, 1);
    }

    #[test]
    fn test_record_gives_up_after_max_retries() {
        let mut config = AttestConfig::default();
        config.append.max_retries = 1;
        let trail = AuditTrail::new(Arc::new(FlakyLedger::with_conflicts(5)), config);

        let err = trail.record(event("auth.login", "ws-a")).unwrap_err();
        assert!(matches!(err, AuditError::AppendConflict { .. }));
        assert_eq!(trail.ledger().count().unwrap(), 0);
    }

    #[test]
    fn test_record_throttled_suppresses_repeats() {
        let trail = AuditTrail::new(Arc::new(InMemoryLedger::new()), AttestConfig::default());

        let view = || event("document.view", "ws-a");
        assert!(trail.record_throttled(view()).unwrap().is_some());
        assert!(trail.record_throttled(view()).unwrap().is_none());

        // A different resource is a different event.
        let other = NewAuditEvent::new("document.view")
            .workspace("ws-a")
            .actor("user-7")
            .resource("document", "doc-43");
        assert!(trail.record_throttled(other).unwrap().is_some());

        // The same view in another workspace is a different event.
        assert!(trail.record_throttled(event("document.view", "ws-b")).unwrap().is_some());
        assert!(trail.record_throttled(event("document.view", "ws-b")).unwrap().is_none());

        // Actions outside the dedup list are always recorded.
        assert!(trail.record_throttled(event("document.update", "ws-a")).unwrap().is_some());
        assert!(trail.record_throttled(event("document.update", "ws-a")).unwrap().is_some());

        assert_eq!(trail.ledger().count().unwrap(), 5);
        assert!(trail.verify(None, None).unwrap().valid);
    }

    #[test]
    fn test_zero_window_disables_dedup() {
        let mut config = AttestConfig::default();
        config.dedup.window_secs = 0;
        let trail = AuditTrail::new(Arc::new(InMemoryLedger::new()), config);

        for _ in 0..3 {
            assert!(trail.record_throttled(event("document.view", "ws-a")).unwrap().is_some());
        }
        assert_eq!(trail.ledger().count().unwrap(), 3);
    }

    /// A failed append does not count towards the dedup window.
    #[test]
    fn test_failed_append_releases_dedup_slot() {
        let mut config = AttestConfig::default();
        config.append.max_retries = 0;
        let trail = AuditTrail::new(Arc::new(FlakyLedger::with_conflicts(1)), config);

        assert!(trail.record_throttled(event("document.view", "ws-a")).is_err());
        assert!(trail.record_throttled(event("document.view", "ws-a")).unwrap().is_some());
    }

    #[test]
    fn test_verify_applies_default_limit() {
        let mut config = AttestConfig::default();
        config.verify.default_limit = Some(3);
        let ledger = Arc::new(ledger_with(5));
        let trail = AuditTrail::new(ledger, config);

        assert_eq!(trail.verify(None, None).unwrap().records_checked, 3);
        assert_eq!(trail.verify(None, Some(5)).unwrap().records_checked, 5);
    }
}
