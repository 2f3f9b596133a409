//! `Ledger` backed by a SQLite database.
//!
//! Appends run inside a `BEGIN IMMEDIATE` transaction: the write lock is
//! taken before the tail is read, so two writers, in this process or any
//! other process sharing the file, can never link to the same tail.  A
//! writer that cannot get the lock within the busy timeout, or that hits
//! the `sequence` uniqueness constraint, reports `AppendConflict`.
//!
//! File-backed ledgers use WAL journaling and a dedicated read connection,
//! so verification scans read a committed snapshot without blocking
//! appends.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{
    ffi, params, params_from_iter, types::Value, Connection, ErrorCode, OptionalExtension, Row,
    TransactionBehavior,
};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};
use uuid::Uuid;

use attest_chain::build_next;
use attest_contracts::{
    error::{AuditError, AuditResult},
    record::{AuditRecord, ChainTail, Digest, NewAuditEvent},
    verify::{RecordRange, ScannedRecord, UnreadableRecord},
};
use attest_core::{
    config::LedgerSection,
    traits::{ChainHead, Ledger},
};

use crate::schema::{init_schema, COLUMNS};

/// Durable, append-only ledger stored in SQLite.
pub struct SqliteLedger {
    pub(crate) writer: Mutex<Connection>,
    /// Separate snapshot reader for file-backed databases.  `None` for
    /// in-memory databases, which cannot be shared across connections.
    reader: Option<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open or create the ledger file at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> AuditResult<Self> {
        let path = path.as_ref();
        if path == Path::new(":memory:") {
            return Self::open_in_memory();
        }
        let writer = Connection::open(path).map_err(storage)?;
        configure(&writer, busy_timeout)?;
        init_schema(&writer).map_err(storage)?;

        let reader = Connection::open(path).map_err(storage)?;
        reader.busy_timeout(busy_timeout).map_err(storage)?;

        info!(path = %path.display(), "opened sqlite audit ledger");
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
        })
    }

    /// Open the ledger described by a `[ledger]` configuration section.
    pub fn from_config(section: &LedgerSection) -> AuditResult<Self> {
        Self::open(&section.path, Duration::from_millis(section.busy_timeout_ms))
    }

    /// A private in-memory database.  Lost when the ledger is dropped.
    pub fn open_in_memory() -> AuditResult<Self> {
        let writer = Connection::open_in_memory().map_err(storage)?;
        init_schema(&writer).map_err(storage)?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: None,
        })
    }

    fn lock_writer(&self) -> AuditResult<MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|e| AuditError::Storage {
            reason: format!("sqlite writer lock poisoned: {}", e),
        })
    }

    fn lock_reader(&self) -> AuditResult<MutexGuard<'_, Connection>> {
        match &self.reader {
            Some(reader) => reader.lock().map_err(|e| AuditError::Storage {
                reason: format!("sqlite reader lock poisoned: {}", e),
            }),
            None => self.lock_writer(),
        }
    }

    fn query(&self, range: &RecordRange) -> AuditResult<Vec<StoredRow>> {
        range.check()?;

        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(from) = range.from_sequence {
            clauses.push("sequence >= ?");
            args.push(Value::Integer(to_sql_seq(from)?));
        }
        if let Some(to) = range.to_sequence {
            clauses.push("sequence <= ?");
            args.push(Value::Integer(to_sql_seq(to)?));
        }
        if let Some(since) = range.since {
            clauses.push("created_at >= ?");
            args.push(Value::Text(format_timestamp(&since)));
        }
        if let Some(ws) = &range.workspace_id {
            clauses.push("workspace_id = ?");
            args.push(Value::Text(ws.clone()));
        }
        // SQLite treats a negative LIMIT as "no limit".
        args.push(Value::Integer(
            range.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX)),
        ));

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT {COLUMNS} FROM audit_log {where_sql} ORDER BY sequence ASC LIMIT ?");

        let conn = self.lock_reader()?;
        let mut stmt = conn.prepare(&sql).map_err(storage)?;
        let rows = stmt
            .query_map(params_from_iter(args), StoredRow::from_row)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(rows)
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> AuditResult<()> {
    conn.busy_timeout(busy_timeout).map_err(storage)?;
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(storage)?;
    debug!(journal_mode = %mode, "sqlite journal mode set");
    Ok(())
}

// ── Ledger impl ───────────────────────────────────────────────────────────────

impl Ledger for SqliteLedger {
    fn append(&self, event: NewAuditEvent) -> AuditResult<AuditRecord> {
        let mut conn = self.lock_writer()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(write_error)?;

        let record = build_next(&TxHead(&tx), event, Utc::now())?;
        insert(&tx, &record)?;
        tx.commit().map_err(write_error)?;

        debug!(sequence = record.sequence, action = %record.action, "appended to sqlite ledger");
        Ok(record)
    }

    fn tail(&self) -> AuditResult<Option<ChainTail>> {
        let conn = self.lock_reader()?;
        TxHead(&conn).head()
    }

    fn read_range(&self, range: &RecordRange) -> AuditResult<Vec<AuditRecord>> {
        self.query(range)?
            .into_iter()
            .map(|row| match row.decode()? {
                ScannedRecord::Intact(record) => Ok(record),
                ScannedRecord::Unreadable(row) => Err(unreadable(row.sequence, row.reason)),
            })
            .collect()
    }

    fn scan(&self, range: &RecordRange) -> AuditResult<Vec<ScannedRecord>> {
        self.query(range)?.into_iter().map(StoredRow::decode).collect()
    }

    fn count(&self) -> AuditResult<u64> {
        let conn = self.lock_reader()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .map_err(storage)?;
        Ok(n.max(0) as u64)
    }
}

// ── Tail view inside the append transaction ──────────────────────────────────

struct TxHead<'c>(&'c Connection);

impl ChainHead for TxHead<'_> {
    fn head(&self) -> AuditResult<Option<ChainTail>> {
        let row = self
            .0
            .query_row(
                "SELECT sequence, record_hash, created_at FROM audit_log ORDER BY sequence DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(storage)?;

        row.map(|(sequence, hash, created_at)| {
            Ok(ChainTail {
                sequence: from_sql_seq(sequence)?,
                record_hash: parse_digest(&hash, "record_hash")
                    .map_err(|reason| unreadable(sequence, reason))?,
                created_at: parse_timestamp(&created_at)
                    .map_err(|reason| unreadable(sequence, reason))?,
            })
        })
        .transpose()
    }
}

fn insert(conn: &Connection, record: &AuditRecord) -> AuditResult<()> {
    let details = serde_json::to_string(&record.details).map_err(|e| AuditError::Encoding {
        reason: format!("details could not be serialized: {e}"),
    })?;

    conn.execute(
        "INSERT INTO audit_log (sequence, id, workspace_id, actor_id, impersonating_actor_id, action,
             resource_type, resource_id, details, ip_address, user_agent, created_at,
             previous_hash, record_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            to_sql_seq(record.sequence)?,
            record.id.to_string(),
            record.workspace_id,
            record.actor_id,
            record.impersonating_actor_id,
            record.action,
            record.resource_type,
            record.resource_id,
            details,
            record.ip_address,
            record.user_agent,
            format_timestamp(&record.created_at),
            record.previous_hash.to_hex(),
            record.record_hash.to_hex(),
        ],
    )
    .map_err(write_error)?;
    Ok(())
}

// ── Row decoding ──────────────────────────────────────────────────────────────

/// A row as stored, before any parsing that can fail on tampered text.
struct StoredRow {
    sequence: i64,
    id: String,
    workspace_id: Option<String>,
    actor_id: Option<String>,
    impersonating_actor_id: Option<String>,
    action: String,
    resource_type: Option<String>,
    resource_id: Option<String>,
    details: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    created_at: String,
    previous_hash: String,
    record_hash: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            id: row.get(1)?,
            workspace_id: row.get(2)?,
            actor_id: row.get(3)?,
            impersonating_actor_id: row.get(4)?,
            action: row.get(5)?,
            resource_type: row.get(6)?,
            resource_id: row.get(7)?,
            details: row.get(8)?,
            ip_address: row.get(9)?,
            user_agent: row.get(10)?,
            created_at: row.get(11)?,
            previous_hash: row.get(12)?,
            record_hash: row.get(13)?,
        })
    }

    /// Decode the row.  Columns that no longer parse yield
    /// `ScannedRecord::Unreadable` naming each failure.
    fn decode(self) -> AuditResult<ScannedRecord> {
        let sequence = from_sql_seq(self.sequence)?;
        let id = Uuid::parse_str(&self.id).map_err(|e| format!("id: {e}"));
        let details = serde_json::from_str::<Map<String, JsonValue>>(&self.details)
            .map_err(|e| format!("details: {e}"));
        let created_at = parse_timestamp(&self.created_at);
        let previous_hash = parse_digest(&self.previous_hash, "previous_hash");
        let record_hash = parse_digest(&self.record_hash, "record_hash");

        if let (Ok(id), Ok(details), Ok(created_at), Ok(previous_hash), Ok(record_hash)) =
            (&id, &details, &created_at, &previous_hash, &record_hash)
        {
            return Ok(ScannedRecord::Intact(AuditRecord {
                sequence,
                id: *id,
                workspace_id: self.workspace_id,
                actor_id: self.actor_id,
                impersonating_actor_id: self.impersonating_actor_id,
                action: self.action,
                resource_type: self.resource_type,
                resource_id: self.resource_id,
                details: details.clone(),
                ip_address: self.ip_address,
                user_agent: self.user_agent,
                created_at: *created_at,
                previous_hash: *previous_hash,
                record_hash: *record_hash,
            }));
        }

        let reason = [
            id.as_ref().err(),
            details.as_ref().err(),
            created_at.as_ref().err(),
            previous_hash.as_ref().err(),
            record_hash.as_ref().err(),
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");

        Ok(ScannedRecord::Unreadable(UnreadableRecord {
            sequence,
            id: id.ok(),
            action: self.action,
            created_at: created_at.ok(),
            workspace_id: self.workspace_id,
            previous_hash: previous_hash.ok(),
            record_hash: record_hash.ok(),
            reason,
        }))
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("created_at: {e}"))
}

fn parse_digest(s: &str, column: &str) -> Result<Digest, String> {
    s.parse::<Digest>().map_err(|e| format!("{column}: {e}"))
}

fn to_sql_seq(sequence: u64) -> AuditResult<i64> {
    i64::try_from(sequence).map_err(|_| AuditError::InvalidRange {
        reason: format!("sequence {sequence} exceeds the storable range"),
    })
}

fn from_sql_seq(sequence: i64) -> AuditResult<u64> {
    u64::try_from(sequence).map_err(|_| unreadable(sequence, "negative sequence".to_string()))
}

fn unreadable(seq: impl std::fmt::Display, reason: String) -> AuditError {
    AuditError::Storage {
        reason: format!("audit_log row {seq} is unreadable ({reason})"),
    }
}

// ── Error mapping ─────────────────────────────────────────────────────────────

fn storage(err: rusqlite::Error) -> AuditError {
    AuditError::Storage {
        reason: err.to_string(),
    }
}

/// Lock contention and sequence collisions are lost races, not failures.
fn write_error(err: rusqlite::Error) -> AuditError {
    if let rusqlite::Error::SqliteFailure(ref e, _) = err {
        let lost_race = matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE;
        if lost_race {
            return AuditError::AppendConflict {
                reason: err.to_string(),
            };
        }
    }
    storage(err)
}
