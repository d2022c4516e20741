//! Archive command implementation.

use super::ensure_environment;
use crate::CliResult;
use rangedb_core::{EnvConfig, Environment, LogFileId};
use std::path::Path;

/// Runs the archive command.
pub fn run(path: &Path, dry_run: bool) -> CliResult<()> {
    let files = archive(path, dry_run)?;

    if files.is_empty() {
        println!("No log files can be archived");
        return Ok(());
    }
    let verb = if dry_run { "Can archive" } else { "Removed" };
    println!("{} {} log file(s):", verb, files.len());
    for file in &files {
        println!("  {}", file.file_name());
    }

    Ok(())
}

/// Checkpoints so the cutoff is as recent as possible, then lists or
/// removes the files older than it.
fn archive(path: &Path, dry_run: bool) -> CliResult<Vec<LogFileId>> {
    ensure_environment(path)?;
    let env = Environment::open(path, EnvConfig::default().create_if_missing(false))?;
    let report = env.checkpoint()?;
    tracing::debug!(begin = %report.begin_lsn, oldest_required = %report.oldest_required, "checkpoint before archive");

    let files = if dry_run {
        env.archive()?
    } else {
        env.purge_archived()?
    };
    env.close()?;
    Ok(files)
}
