//! # attest-core
//!
//! Trait seams and configuration for the attest audit ledger.
//!
//! This crate provides:
//! - The `Ledger` and `ChainHead` traits every store implements
//! - `AttestConfig`, the TOML configuration shared by the service and CLI

pub mod config;
pub mod traits;

pub use config::AttestConfig;
pub use traits::{ChainHead, Ledger};
