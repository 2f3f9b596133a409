//! Canonical encoding of an audit record.
//!
//! The encoding is compact JSON text with a fixed, positional layout so it
//! can be reproduced by any implementation that reads the ledger:
//!
//! ```text
//! ["attest.v1",<sequence>,"<id>","<created_at>",<workspace_id>,<actor_id>,
//!  <impersonating_actor_id>,"<action>",<resource_type>,<resource_id>,
//!  <details>,<ip_address>,<user_agent>]
//! ```
//!
//! - Absent optional fields are written as `null`, never omitted.
//! - `created_at` is RFC 3339 UTC with exactly six fractional digits and `Z`.
//! - `details` keys are sorted by their UTF-8 bytes at every nesting level.
//! - Strings escape only `"`, `\`, and code points below U+0020 (`\u00xx`);
//!   everything else is written as raw UTF-8.
//! - `previous_hash` and `record_hash` are not part of the payload.  The
//!   hash engine chains `previous_hash` in front of these bytes.

use std::fmt::Write as _;

use chrono::SecondsFormat;
use serde_json::{Map, Value};

use attest_contracts::{
    error::{AuditError, AuditResult},
    record::AuditRecord,
};

/// Format tag written as the first element of every payload.
pub const ENCODING_VERSION: &str = "attest.v1";

/// Encode every hashed field of `record` into canonical bytes.
///
/// # Errors
///
/// `AuditError::Encoding` if the `action` tag is empty or contains
/// whitespace or control characters.
pub fn encode(record: &AuditRecord) -> AuditResult<Vec<u8>> {
    check_action(&record.action)?;

    let mut out = String::with_capacity(256);
    out.push('[');
    write_str(&mut out, ENCODING_VERSION);
    out.push(',');
    // Writing into a String cannot fail.
    let _ = write!(out, "{}", record.sequence);
    out.push(',');
    write_str(&mut out, &record.id.hyphenated().to_string());
    out.push(',');
    write_str(
        &mut out,
        &record.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
    );
    out.push(',');
    write_opt(&mut out, record.workspace_id.as_deref());
    out.push(',');
    write_opt(&mut out, record.actor_id.as_deref());
    out.push(',');
    write_opt(&mut out, record.impersonating_actor_id.as_deref());
    out.push(',');
    write_str(&mut out, &record.action);
    out.push(',');
    write_opt(&mut out, record.resource_type.as_deref());
    out.push(',');
    write_opt(&mut out, record.resource_id.as_deref());
    out.push(',');
    write_object(&mut out, &record.details);
    out.push(',');
    write_opt(&mut out, record.ip_address.as_deref());
    out.push(',');
    write_opt(&mut out, record.user_agent.as_deref());
    out.push(']');

    Ok(out.into_bytes())
}

/// Encode a JSON value with sorted object keys and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn check_action(action: &str) -> AuditResult<()> {
    if action.is_empty() {
        return Err(AuditError::Encoding {
            reason: "action tag must not be empty".to_string(),
        });
    }
    if let Some(c) = action.chars().find(|c| c.is_whitespace() || c.is_control()) {
        return Err(AuditError::Encoding {
            reason: format!("action tag '{}' contains forbidden character {:?}", action, c),
        });
    }
    Ok(())
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{}", n);
        }
        Value::String(s) => write_str(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map),
    }
}

fn write_object(out: &mut String, map: &Map<String, Value>) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_str(out, key);
        out.push(':');
        write_value(out, value);
    }
    out.push('}');
}

fn write_opt(out: &mut String, value: Option<&str>) {
    match value {
        Some(s) => write_str(out, s),
        None => out.push_str("null"),
    }
}

fn write_str(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
