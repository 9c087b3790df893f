//! Offline verification of a ledger directory.
//!
//! Exits 0 when the chain is intact, 1 when it is broken and 2 when the
//! ledger cannot be read at all.

use clap::Parser;
use financial_agent_audit::{
    ledger::JsonlLedgerStore, verify::IntegrityVerifier, TipCommitment,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "ledger-verify",
    about = "Verify the hash chain of an audit ledger directory"
)]
struct Cli {
    /// Directory holding the ledger segments.
    #[arg(long, env = "LEDGER_DIR", default_value = "./ledger")]
    ledger_dir: PathBuf,

    /// Sequence number of a previously published tip.
    #[arg(long, requires = "commitment_hash")]
    commitment_seq: Option<u64>,

    /// Hash of a previously published tip.
    #[arg(long, requires = "commitment_seq")]
    commitment_hash: Option<String>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if !cli.ledger_dir.is_dir() {
        eprintln!("Ledger directory not found: {}", cli.ledger_dir.display());
        return ExitCode::from(2);
    }

    let store = match JsonlLedgerStore::open(&cli.ledger_dir).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open ledger: {e}");
            return ExitCode::from(2);
        }
    };

    let verifier = IntegrityVerifier::new();
    let result = match (cli.commitment_seq, cli.commitment_hash) {
        (Some(sequence_no), Some(hash)) => {
            let commitment = TipCommitment {
                sequence_no,
                hash: hash.to_lowercase(),
                epoch: 0,
            };
            verifier.verify_with_commitment(&store, &commitment).await
        }
        _ => verifier.verify_store(&store).await,
    };

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Failed to read ledger: {e}");
            return ExitCode::from(2);
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Failed to encode report: {e}");
                return ExitCode::from(2);
            }
        }
    } else if report.ok {
        println!(
            "OK: {} entries across {} epoch(s)",
            report.entries_checked, report.epochs
        );
    } else {
        println!(
            "BROKEN at sequence {}: {}",
            report
                .first_bad_sequence
                .map(|seq| seq.to_string())
                .unwrap_or_else(|| "?".to_string()),
            report.reason.as_deref().unwrap_or("unknown")
        );
    }

    if report.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
