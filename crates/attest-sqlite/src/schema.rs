//! Table layout and the append-only guard.
//!
//! `audit_log` mirrors `AuditRecord` column for column.  `sequence` is the
//! rowid, so it is unique and range scans in sequence order use the primary
//! key.  Timestamps are stored as fixed-width RFC 3339 text, which sorts
//! chronologically.
//!
//! The two triggers reject every UPDATE and DELETE against the table,
//! whoever issues it.  Removing them requires DDL, which is itself visible.

use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_log (
    sequence               INTEGER PRIMARY KEY CHECK (sequence > 0),
    id                     TEXT    NOT NULL UNIQUE,
    workspace_id           TEXT,
    actor_id               TEXT,
    impersonating_actor_id TEXT,
    action                 TEXT    NOT NULL,
    resource_type          TEXT,
    resource_id            TEXT,
    details                TEXT    NOT NULL,
    ip_address             TEXT,
    user_agent             TEXT,
    created_at             TEXT    NOT NULL,
    previous_hash          TEXT    NOT NULL,
    record_hash            TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_workspace ON audit_log(workspace_id, sequence);
CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log(created_at);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only: UPDATE rejected');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only: DELETE rejected');
END;
";

/// Column list shared by every SELECT so rows decode positionally.
pub const COLUMNS: &str = "sequence, id, workspace_id, actor_id, impersonating_actor_id, action, \
     resource_type, resource_id, details, ip_address, user_agent, created_at, \
     previous_hash, record_hash";

/// Create the table, indexes, and guard triggers if they do not exist.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
