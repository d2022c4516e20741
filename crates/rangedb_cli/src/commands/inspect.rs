//! Inspect command implementation.

use super::open_offline;
use crate::{CliResult, OutputFormat};
use rangedb_core::log::LogReader;
use rangedb_core::{ImageTreeStore, TreeStore, VersionState};
use rangedb_storage::{BackendProvider, StorageBackend};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Environment inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Environment path.
    pub path: String,
    /// LSN the checkpoint image was flushed at.
    pub image_lsn: u64,
    /// Number of dictionaries in the image catalog.
    pub dictionary_count: usize,
    /// Number of keys stored in the image.
    pub key_count: usize,
    /// Number of versions stored in the image.
    pub version_count: usize,
    /// Number of log files.
    pub log_file_count: usize,
    /// Total log size in bytes.
    pub log_bytes: u64,
    /// Dictionary statistics (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dictionaries: Option<Vec<DictionaryStats>>,
    /// Log file statistics (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_files: Option<Vec<LogFileStats>>,
}

/// Statistics for one dictionary in the image.
#[derive(Debug, Serialize)]
pub struct DictionaryStats {
    /// Dictionary id.
    pub id: u32,
    /// Dictionary name.
    pub name: String,
    /// Key comparator.
    pub comparator: String,
    /// Keys whose newest version is a value.
    pub live_keys: usize,
    /// Keys whose newest version is a tombstone.
    pub tombstones: usize,
}

/// Statistics for one log file.
#[derive(Debug, Serialize)]
pub struct LogFileStats {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// First LSN the file holds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_lsn: Option<u64>,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_dictionaries: bool,
    show_logs: bool,
    format: OutputFormat,
) -> CliResult<()> {
    let (_dir, provider) = open_offline(path)?;
    let result = inspect(path, provider, show_dictionaries, show_logs)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Text => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn inspect(
    path: &Path,
    provider: Arc<dyn BackendProvider>,
    show_dictionaries: bool,
    show_logs: bool,
) -> CliResult<InspectResult> {
    let snapshot = ImageTreeStore::open(Arc::clone(&provider))?.load()?;

    let mut dictionaries: Vec<DictionaryStats> = snapshot
        .catalog
        .dicts
        .iter()
        .map(|entry| DictionaryStats {
            id: entry.id.0,
            name: entry.name.clone(),
            comparator: entry.comparator.clone(),
            live_keys: 0,
            tombstones: 0,
        })
        .collect();
    let mut version_count = 0;
    for (dict, _key, versions) in &snapshot.chains {
        version_count += versions.len();
        let newest_committed = versions
            .iter()
            .find(|v| matches!(v.state, VersionState::Committed { .. }));
        if let Some(stats) = dictionaries.iter_mut().find(|s| s.id == dict.0) {
            match newest_committed {
                Some(version) if version.is_tombstone() => stats.tombstones += 1,
                Some(_) => stats.live_keys += 1,
                None => {}
            }
        }
    }

    let reader = LogReader::open(Arc::clone(&provider))?;
    let mut log_files = Vec::new();
    for &id in reader.file_ids() {
        let name = id.file_name();
        let size = provider.open(&name)?.size()?;
        let first_lsn = reader
            .iter_file(id)
            .ok()
            .and_then(|iter| iter.header())
            .map(|header| header.first_lsn.0);
        log_files.push(LogFileStats {
            name,
            size,
            first_lsn,
        });
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        image_lsn: snapshot.flushed_lsn.0,
        dictionary_count: dictionaries.len(),
        key_count: snapshot.chains.len(),
        version_count,
        log_file_count: log_files.len(),
        log_bytes: log_files.iter().map(|f| f.size).sum(),
        dictionaries: show_dictionaries.then_some(dictionaries),
        log_files: show_logs.then_some(log_files),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("RangeDB Environment: {}", result.path);
    println!("================");
    println!("Image flushed at LSN: {}", result.image_lsn);
    println!("Dictionaries: {}", result.dictionary_count);
    println!("Keys: {}", result.key_count);
    println!("Versions: {}", result.version_count);
    println!(
        "Log: {} file(s), {} bytes",
        result.log_file_count, result.log_bytes
    );

    if let Some(dictionaries) = &result.dictionaries {
        println!();
        println!("Dictionaries:");
        for dict in dictionaries {
            println!(
                "  [{}] {} ({}): {} live, {} tombstones",
                dict.id, dict.name, dict.comparator, dict.live_keys, dict.tombstones
            );
        }
    }

    if let Some(files) = &result.log_files {
        println!();
        println!("Log files:");
        for file in files {
            match file.first_lsn {
                Some(lsn) => println!("  {} {} bytes, from LSN {}", file.name, file.size, lsn),
                None => println!("  {} {} bytes, damaged header", file.name, file.size),
            }
        }
    }
}
