//! attest — operator CLI for the tamper-evident audit ledger.
//!
//! Records events into, inspects, and verifies a SQLite-backed ledger.
//!
//! Usage:
//!   attest --db audit.db init
//!   attest --db audit.db record --action admin.update_credentials --actor u-1 --detail reason=rotation
//!   attest --db audit.db verify --workspace ws-1 --limit 10000
//!   attest --db audit.db show --from 100 --limit 20
//!   attest --db audit.db head
//!
//! Exit codes: 0 success, 1 error (including "could not verify"),
//! 2 chain verified and found invalid.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use attest_chain::AuditTrail;
use attest_contracts::{
    error::{AuditError, AuditResult},
    record::{AuditRecord, NewAuditEvent},
    verify::{RecordRange, VerificationResult, VerifyOptions},
};
use attest_core::config::{AttestConfig, LedgerBackend};
use attest_sqlite::open_ledger;

// ── CLI definition ────────────────────────────────────────────────────────────

/// attest — append-only, hash-chained audit ledger.
#[derive(Parser)]
#[command(
    name = "attest",
    about = "Tamper-evident audit ledger",
    long_about = "Records security-relevant events into a SHA-256 hash-chained,\n\
                  append-only ledger and verifies that its history is intact."
)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite ledger file.  Overrides `ledger.path` from the configuration.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the ledger (schema and append-only guard) if it does not exist.
    Init,
    /// Append one event to the chain.
    Record(RecordArgs),
    /// Recompute the chain and report divergent records.
    Verify(VerifyArgs),
    /// Print records in sequence order.
    Show(ShowArgs),
    /// Print the chain tail.
    Head,
}

#[derive(clap::Args)]
struct RecordArgs {
    /// Namespaced action tag, e.g. `auth.login`.
    #[arg(long)]
    action: String,
    #[arg(long)]
    actor: Option<String>,
    /// Identity the actor is impersonating.
    #[arg(long)]
    impersonating: Option<String>,
    #[arg(long)]
    workspace: Option<String>,
    #[arg(long, requires = "resource_id")]
    resource_type: Option<String>,
    #[arg(long, requires = "resource_type")]
    resource_id: Option<String>,
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    user_agent: Option<String>,
    /// `key=value`; values that parse as JSON are stored as JSON.
    #[arg(long = "detail", value_parser = parse_detail)]
    details: Vec<(String, Value)>,
}

#[derive(clap::Args)]
struct VerifyArgs {
    /// Report only divergent records in this workspace.
    #[arg(long)]
    workspace: Option<String>,
    /// First sequence to scan.
    #[arg(long)]
    from: Option<u64>,
    /// Start at the first record created at or after this RFC 3339 instant.
    #[arg(long, value_parser = parse_instant)]
    since: Option<DateTime<Utc>>,
    /// Maximum number of records to scan.
    #[arg(long)]
    limit: Option<usize>,
    /// Expected previous hash of the first scanned record.
    #[arg(long)]
    anchor: Option<String>,
    /// Print the full report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(clap::Args)]
struct ShowArgs {
    #[arg(long)]
    from: Option<u64>,
    #[arg(long)]
    to: Option<u64>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long)]
    workspace: Option<String>,
    /// Print records as JSON lines.
    #[arg(long)]
    json: bool,
}

fn parse_detail(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err("detail key must not be empty".to_string());
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp '{s}': {e}"))
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    // Initialize structured logging.  Set RUST_LOG=debug for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("attest error: {}", e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_ref(), cli.db)?;
    let trail = AuditTrail::new(open_ledger(&config)?, config);

    match cli.command {
        Command::Init => {
            let count = trail.ledger().count()?;
            println!(
                "ledger ready at {} ({} records)",
                trail.config().ledger.path.display(),
                count
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Record(args) => {
            let record = trail.record(build_event(args)?)?;
            println!("{}", format_record(&record));
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify(args) => run_verify(&trail, args),
        Command::Show(args) => {
            let range = RecordRange {
                from_sequence: args.from,
                to_sequence: args.to,
                since: None,
                limit: Some(args.limit),
                workspace_id: args.workspace,
            };
            for record in trail.ledger().read_range(&range)? {
                if args.json {
                    println!("{}", serde_json::to_string(&record)?);
                } else {
                    println!("{}", format_record(&record));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Head => {
            match trail.ledger().tail()? {
                Some(tail) => println!("{} {} {}", tail.sequence, tail.record_hash, tail.created_at),
                None => println!("empty ledger"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&PathBuf>, db: Option<PathBuf>) -> AuditResult<AttestConfig> {
    let mut config = match path {
        Some(path) => AttestConfig::from_file(path)?,
        None => AttestConfig::default(),
    };
    if let Some(db) = db {
        config.ledger.backend = LedgerBackend::Sqlite;
        config.ledger.path = db;
    }
    debug!(path = %config.ledger.path.display(), "using ledger");
    Ok(config)
}

fn build_event(args: RecordArgs) -> AuditResult<NewAuditEvent> {
    let mut event = NewAuditEvent::new(args.action).provenance(args.ip, args.user_agent);
    event.workspace_id = args.workspace;
    event.actor_id = args.actor;
    event.impersonating_actor_id = args.impersonating;
    event.resource_type = args.resource_type;
    event.resource_id = args.resource_id;
    for (key, value) in args.details {
        event = event.detail(key, value)?;
    }
    Ok(event)
}

fn run_verify(trail: &AuditTrail, args: VerifyArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let anchor = args
        .anchor
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|e: AuditError| format!("invalid --anchor: {e}"))?;

    let options = VerifyOptions {
        from_sequence: args.from,
        since: args.since,
        limit: args.limit.or(trail.config().verify.default_limit),
        anchor,
        workspace_id: args.workspace,
    };
    let report = trail.verify_with(&options)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

// ── Output ────────────────────────────────────────────────────────────────────

fn format_record(record: &AuditRecord) -> String {
    format!(
        "#{:<6} {} {:<28} actor={} workspace={} resource={} hash={}",
        record.sequence,
        record.created_at.to_rfc3339(),
        record.action,
        record.actor_id.as_deref().unwrap_or("-"),
        record.workspace_id.as_deref().unwrap_or("-"),
        match (&record.resource_type, &record.resource_id) {
            (Some(t), Some(id)) => format!("{t}/{id}"),
            _ => "-".to_string(),
        },
        &record.record_hash.to_hex()[..16],
    )
}

fn print_report(report: &VerificationResult) {
    let window = match (report.first_sequence, report.last_sequence) {
        (Some(first), Some(last)) => format!("sequences {first}..={last}"),
        _ => "no records".to_string(),
    };
    println!(
        "chain {}: {} records checked ({})",
        if report.valid { "VALID" } else { "INVALID" },
        report.records_checked,
        window
    );
    for summary in &report.invalid_records {
        println!(
            "  ✗ #{} {} {} workspace={} {:?} stored={}",
            summary.sequence,
            summary
                .created_at
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
            summary.action,
            summary.workspace_id.as_deref().unwrap_or("-"),
            summary.kind,
            summary
                .stored_hash
                .map_or_else(|| "-".to_string(), |h| h.to_hex()),
        );
        if let Some(reason) = &summary.decode_error {
            println!("      unreadable row: {reason}");
        }
    }
    if !report.valid && report.invalid_records.is_empty() {
        println!("  (divergent records lie outside the requested workspace)");
    }
    if let Some(head) = report.head_hash {
        println!("head hash: {head}");
    }
}
