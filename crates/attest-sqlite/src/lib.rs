//! # attest-sqlite
//!
//! Durable SQLite storage for the attest audit ledger.
//!
//! Immutability is enforced twice: the `Ledger` contract has no update or
//! delete operation, and the `audit_log` table carries triggers that abort
//! any UPDATE or DELETE issued directly against the database.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use attest_core::config::AttestConfig;
//! use attest_sqlite::open_ledger;
//!
//! let config = AttestConfig::from_file(Path::new("attest.toml"))?;
//! let ledger = open_ledger(&config)?;
//! ```

pub mod ledger;
pub mod schema;

use std::sync::Arc;

use attest_chain::InMemoryLedger;
use attest_contracts::error::AuditResult;
use attest_core::{
    config::{AttestConfig, LedgerBackend},
    traits::Ledger,
};

pub use ledger::SqliteLedger;

/// Open the ledger backend selected by `config.ledger.backend`.
pub fn open_ledger(config: &AttestConfig) -> AuditResult<Arc<dyn Ledger>> {
    match config.ledger.backend {
        LedgerBackend::Sqlite => Ok(Arc::new(SqliteLedger::from_config(&config.ledger)?)),
        LedgerBackend::Memory => Ok(Arc::new(InMemoryLedger::new())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
