//! Recover command implementation.

use super::ensure_environment;
use crate::{CliResult, OutputFormat};
use rangedb_core::{EnvConfig, Environment, RecoveryReport};
use serde::Serialize;
use std::path::Path;

/// Recovery outcome in printable form.
#[derive(Debug, Serialize)]
pub struct RecoverySummary {
    /// The log ended with a quiescent checkpoint.
    pub clean_shutdown: bool,
    /// Checkpoint recovery started from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_lsn: Option<u64>,
    /// First LSN replayed.
    pub scan_start: u64,
    /// Records replayed.
    pub records_scanned: usize,
    /// Committed families redone.
    pub committed: usize,
    /// Logged aborts replayed.
    pub aborted: usize,
    /// Unfinished transactions rolled back.
    pub losers: Vec<u64>,
    /// Provisional versions with no owner in the log.
    pub orphaned_versions: usize,
    /// Versions removed by garbage collection.
    pub versions_collected: u64,
    /// Damage cut off the end of the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torn_tail: Option<String>,
}

impl From<&RecoveryReport> for RecoverySummary {
    fn from(report: &RecoveryReport) -> Self {
        Self {
            clean_shutdown: report.clean_shutdown,
            checkpoint_lsn: report.checkpoint.map(|lsn| lsn.0),
            scan_start: report.scan_start.0,
            records_scanned: report.records_scanned,
            committed: report.committed,
            aborted: report.aborted,
            losers: report.losers.iter().map(|txn| txn.0).collect(),
            orphaned_versions: report.orphaned_versions,
            versions_collected: report.versions_collected,
            torn_tail: report
                .torn_tail
                .as_ref()
                .map(|torn| format!("{} at offset {}: {}", torn.file, torn.valid_len, torn.reason)),
        }
    }
}

/// Runs the recover command.
pub fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let summary = recover(path)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            print_text_output(&summary);
        }
    }

    Ok(())
}

fn recover(path: &Path) -> CliResult<RecoverySummary> {
    ensure_environment(path)?;
    let env = Environment::open(path, EnvConfig::default().create_if_missing(false))?;
    let summary = RecoverySummary::from(env.recovery_report());
    env.close()?;
    Ok(summary)
}

fn print_text_output(summary: &RecoverySummary) {
    println!("Recovery");
    println!("================");
    match summary.checkpoint_lsn {
        Some(lsn) => println!("Started from checkpoint at LSN {}", lsn),
        None => println!("No checkpoint found, replayed the whole log"),
    }
    if summary.clean_shutdown {
        println!("Previous shutdown was clean");
    }
    println!(
        "Replayed {} record(s) from LSN {}",
        summary.records_scanned, summary.scan_start
    );
    println!("Committed: {}", summary.committed);
    println!("Aborted:   {}", summary.aborted);
    if summary.losers.is_empty() {
        println!("Rolled back: none");
    } else {
        let ids: Vec<String> = summary.losers.iter().map(u64::to_string).collect();
        println!("Rolled back: {}", ids.join(", "));
    }
    if summary.orphaned_versions > 0 {
        println!("Orphaned versions dropped: {}", summary.orphaned_versions);
    }
    println!("Versions collected: {}", summary.versions_collected);
    if let Some(torn) = &summary.torn_tail {
        println!("Torn tail cut off: {}", torn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::populated_env;
    use crate::CliError;

    #[test]
    fn clean_environment_needs_no_undo() {
        let dir = tempfile::tempdir().unwrap();
        populated_env(dir.path());

        let summary = recover(dir.path()).unwrap();
        assert!(summary.clean_shutdown);
        assert!(summary.checkpoint_lsn.is_some());
        assert!(summary.losers.is_empty());
        assert!(summary.torn_tail.is_none());
    }

    #[test]
    fn refuses_to_create_an_environment() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            recover(dir.path()),
            Err(CliError::NotAnEnvironment(_))
        ));
        assert!(!dir.path().join("log").exists());
    }
}
