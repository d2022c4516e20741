//! Verify command implementation.

use super::open_offline;
use crate::{CliError, CliResult};
use rangedb_core::log::LogReader;
use rangedb_core::{ImageTreeStore, Lsn, TreeStore, VersionState};
use rangedb_storage::BackendProvider;
use std::path::Path;
use std::sync::Arc;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of items checked.
    pub checked: usize,
    /// Damage found at the end of the newest log file.
    pub torn_tail: Option<String>,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, check_log: bool, check_image: bool) -> CliResult<()> {
    println!("Verifying environment at {:?}", path);
    println!();

    let (_dir, provider) = open_offline(path)?;
    let mut problems = 0;

    if check_log {
        println!("Checking log...");
        let result = verify_log(Arc::clone(&provider))?;
        print_result("Log records", &result);
        problems += result.errors.len();
    }

    if check_image {
        println!("Checking checkpoint image...");
        let result = verify_image(provider);
        print_result("Image chains", &result);
        problems += result.errors.len();
    }

    println!();
    if problems == 0 {
        println!("✓ Environment verification passed");
        Ok(())
    } else {
        println!("✗ Environment verification failed");
        Err(CliError::VerifyFailed(problems))
    }
}

/// Reads every log file strictly except the newest, whose torn tail is
/// reported but is not an error; recovery cuts it off.
fn verify_log(provider: Arc<dyn BackendProvider>) -> CliResult<VerifyResult> {
    let reader = LogReader::open(provider)?;
    let mut result = VerifyResult::default();
    let mut previous: Option<Lsn> = None;

    for &id in reader.file_ids() {
        let mut iter = match reader.iter_file(id) {
            Ok(iter) => iter,
            Err(err) => {
                result.errors.push(format!("{id}: {err}"));
                continue;
            }
        };
        if let (Some(header), Some(last)) = (iter.header(), previous) {
            if header.first_lsn != last.next() {
                result.errors.push(format!(
                    "{id} starts at LSN {} but the previous file ends at {}",
                    header.first_lsn, last
                ));
            }
        }
        for entry in iter.by_ref() {
            match entry {
                Ok(entry) => {
                    result.checked += 1;
                    previous = Some(entry.lsn);
                }
                Err(err) => {
                    result.errors.push(err.to_string());
                    break;
                }
            }
        }
        if let Some(torn) = iter.torn_tail() {
            result.torn_tail = Some(format!(
                "{} at offset {}: {}",
                torn.file, torn.valid_len, torn.reason
            ));
        }
    }

    Ok(result)
}

fn verify_image(provider: Arc<dyn BackendProvider>) -> VerifyResult {
    let mut result = VerifyResult::default();
    let snapshot = match ImageTreeStore::open(provider).and_then(|store| store.load()) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            result.errors.push(format!("image unreadable: {err}"));
            return result;
        }
    };

    for (dict, key, versions) in &snapshot.chains {
        result.checked += 1;
        if snapshot.catalog.by_id(*dict).is_none() {
            result
                .errors
                .push(format!("chain for unknown dictionary {dict}"));
        }
        if versions.windows(2).any(|pair| pair[0].lsn <= pair[1].lsn) {
            result
                .errors
                .push(format!("{dict} key {key:?}: versions out of order"));
        }
        for version in versions {
            if let VersionState::Committed { commit_lsn } = version.state {
                if commit_lsn < version.lsn {
                    result.errors.push(format!(
                        "{dict} key {key:?}: committed at {commit_lsn} before written at {}",
                        version.lsn
                    ));
                }
            }
        }
    }

    result
}

fn print_result(name: &str, result: &VerifyResult) {
    println!("  {}: {} checked", name, result.checked);
    if let Some(torn) = &result.torn_tail {
        println!("  Torn tail (recovery will cut it): {}", torn);
    }
    if !result.errors.is_empty() {
        println!("  Errors:");
        for error in &result.errors {
            println!("    - {}", error);
        }
    }
}
