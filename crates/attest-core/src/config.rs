//! TOML configuration for the ledger and its host-facing service.
//!
//! Every section and field has a default, so an empty document is a valid
//! configuration.
//!
//! Example:
//! ```toml
//! [ledger]
//! backend = "sqlite"
//! path = "/var/lib/attest/audit.db"
//! busy_timeout_ms = 5000
//!
//! [append]
//! max_retries = 3
//!
//! [dedup]
//! window_secs = 60
//! actions = ["document.view"]
//!
//! [verify]
//! default_limit = 100000
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use attest_contracts::error::{AuditError, AuditResult};

/// Which store backs the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerBackend {
    /// Durable SQLite file.
    Sqlite,
    /// Process-local, lost on exit.  Tests and dry runs only.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub backend: LedgerBackend,
    /// SQLite database file.  Ignored by the memory backend.
    pub path: PathBuf,
    /// How long a writer waits on a locked database before the append is
    /// reported as an `AppendConflict`.
    pub busy_timeout_ms: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Sqlite,
            path: PathBuf::from("attest.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppendSection {
    /// Extra attempts after an `AppendConflict` before giving up.
    pub max_retries: u32,
}

impl Default for AppendSection {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Host-side suppression of noisy repeated events.
///
/// Applied before an event reaches the ledger; the ledger itself never
/// drops an append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    /// Repeats of the same (workspace, actor, action, resource) inside this
    /// many seconds are skipped.  0 disables deduplication.
    pub window_secs: u64,
    /// Actions subject to deduplication.  Everything else is always recorded.
    pub actions: Vec<String>,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            window_secs: 60,
            actions: vec!["document.view".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifySection {
    /// Scan limit applied when a caller does not pass one.  `None` scans
    /// the whole ledger.
    pub default_limit: Option<usize>,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestConfig {
    pub ledger: LedgerSection,
    pub append: AppendSection,
    pub dedup: DedupSection,
    pub verify: VerifySection,
}

impl AttestConfig {
    /// Parse `s` as TOML.
    ///
    /// Returns `AuditError::Config` if the TOML is malformed, does not match
    /// the schema, or sets `verify.default_limit = 0`.
    pub fn from_toml_str(s: &str) -> AuditResult<Self> {
        let config: AttestConfig = toml::from_str(s).map_err(|e| AuditError::Config {
            reason: format!("failed to parse attest TOML: {}", e),
        })?;
        if config.verify.default_limit == Some(0) {
            return Err(AuditError::Config {
                reason: "verify.default_limit must be at least 1".to_string(),
            });
        }
        debug!(backend = ?config.ledger.backend, path = %config.ledger.path.display(), "configuration loaded");
        Ok(config)
    }

    /// Read the file at `path` and parse it as TOML configuration.
    pub fn from_file(path: &Path) -> AuditResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| AuditError::Config {
            reason: format!("failed to read config file '{}': {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }
}
