//! Audit records and the values that feed them.
//!
//! `NewAuditEvent` is what a caller hands to the ledger: every field of a
//! record that is not assigned by the ledger itself.  `AuditRecord` is the
//! stored, hash-linked unit of the chain.  `Digest` is the 32-byte SHA-256
//! value that links records together.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};

/// A SHA-256 digest linking one record to the next.
///
/// Serialized as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// The `previous_hash` of the first record ever appended.
    ///
    /// All zero bytes.  Part of the published format so that independent
    /// verifiers can bootstrap a chain without any secret.
    pub const GENESIS: Digest = Digest([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_genesis(&self) -> bool {
        *self == Self::GENESIS
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = AuditError;

    fn from_str(s: &str) -> AuditResult<Self> {
        let bytes = hex::decode(s).map_err(|e| AuditError::Encoding {
            reason: format!("digest is not valid hex: {e}"),
        })?;
        let arr: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| AuditError::Encoding {
            reason: format!("digest must be 32 bytes, got {}", b.len()),
        })?;
        Ok(Digest(arr))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Truncate a timestamp to the microsecond precision the canonical
/// encoding and every store can represent exactly.
pub fn canonical_timestamp(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

/// The caller-supplied part of an audit record.
///
/// Build with `NewAuditEvent::new(action)` and the chained setters.  The
/// ledger assigns `sequence`, `id`, `created_at`, and both hashes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub workspace_id: Option<String>,
    pub actor_id: Option<String>,
    pub impersonating_actor_id: Option<String>,
    /// Namespaced action tag, e.g. `"admin.update_credentials"`.
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Supplementary key/value data.  Keeps caller insertion order; the
    /// canonical encoder sorts keys before hashing.
    #[serde(default)]
    pub details: Map<String, Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewAuditEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Record that `actor_id` is acting on behalf of another identity.
    pub fn impersonating(mut self, actor_id: impl Into<String>) -> Self {
        self.impersonating_actor_id = Some(actor_id.into());
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn provenance(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    /// Add one entry to `details`.
    ///
    /// Returns `AuditError::Encoding` if `value` has no JSON representation
    /// (for example a map keyed by a non-string type).
    pub fn detail(mut self, key: impl Into<String>, value: impl Serialize) -> AuditResult<Self> {
        let value = serde_json::to_value(value).map_err(|e| AuditError::Encoding {
            reason: format!("detail value is not serializable: {e}"),
        })?;
        self.details.insert(key.into(), value);
        Ok(self)
    }

    /// Replace `details` with the serialized form of `value`, which must be
    /// a JSON object.
    pub fn details(mut self, value: impl Serialize) -> AuditResult<Self> {
        match serde_json::to_value(value) {
            Ok(Value::Object(map)) => {
                self.details = map;
                Ok(self)
            }
            Ok(other) => Err(AuditError::Encoding {
                reason: format!("details must be a JSON object, got {}", json_kind(&other)),
            }),
            Err(e) => Err(AuditError::Encoding {
                reason: format!("details are not serializable: {e}"),
            }),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One entry of the global hash chain.
///
/// `record_hash` commits to `previous_hash` and to the canonical encoding
/// of every other field.  Changing any field without recomputing the hash,
/// or recomputing the hash without rewriting every later record, is
/// detected by the chain verifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the global chain, starting at 1.
    pub sequence: u64,
    pub id: Uuid,
    pub workspace_id: Option<String>,
    pub actor_id: Option<String>,
    pub impersonating_actor_id: Option<String>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: Map<String, Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Microsecond precision, non-decreasing with `sequence`.
    pub created_at: DateTime<Utc>,
    /// `record_hash` of record `sequence - 1`, or `Digest::GENESIS`.
    pub previous_hash: Digest,
    pub record_hash: Digest,
}

impl AuditRecord {
    pub fn tail(&self) -> ChainTail {
        ChainTail {
            sequence: self.sequence,
            record_hash: self.record_hash,
            created_at: self.created_at,
        }
    }
}

/// The newest record of a chain, as seen by the next append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTail {
    pub sequence: u64,
    pub record_hash: Digest,
    pub created_at: DateTime<Utc>,
}
