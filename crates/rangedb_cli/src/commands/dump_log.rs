//! Dump-log command implementation.

use super::{display_key, open_offline};
use crate::{CliResult, OutputFormat};
use rangedb_core::log::{FileOp, LogEntry, LogReader, LogRecord};
use serde::Serialize;
use std::path::Path;

/// Log record representation for output.
#[derive(Debug, Serialize)]
pub struct LogRecordInfo {
    /// Record LSN.
    pub lsn: u64,
    /// Log file holding the record.
    pub file: String,
    /// Byte offset inside the file.
    pub offset: u64,
    /// Record kind.
    pub kind: String,
    /// Transaction (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn: Option<u64>,
    /// Parent transaction, for nested begins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<u64>,
    /// Dictionary (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dict: Option<u32>,
    /// Key, as text or hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Value size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_size: Option<usize>,
    /// Kind-specific details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LogRecordInfo {
    fn from_entry(entry: &LogEntry) -> Self {
        let mut info = Self {
            lsn: entry.lsn.0,
            file: entry.file.to_string(),
            offset: entry.offset,
            kind: format!("{:?}", entry.record.kind()),
            txn: entry.record.txn().map(|txn| txn.0),
            parent: None,
            dict: None,
            key: None,
            value_size: None,
            detail: None,
        };
        match &entry.record {
            LogRecord::Begin {
                parent, isolation, ..
            } => {
                info.parent = parent.map(|p| p.0);
                info.detail = Some(format!("{isolation:?}"));
            }
            LogRecord::Insert {
                dict, key, value, ..
            } => {
                info.dict = Some(dict.0);
                info.key = Some(display_key(key));
                info.value_size = Some(value.len());
            }
            LogRecord::Delete { dict, key, .. } => {
                info.dict = Some(dict.0);
                info.key = Some(display_key(key));
            }
            LogRecord::Commit { .. } | LogRecord::Abort { .. } => {}
            LogRecord::CheckpointBegin {
                open_txns,
                oldest_required,
            } => {
                info.detail = Some(format!(
                    "open_txns={} oldest_required={}",
                    open_txns.len(),
                    oldest_required.0
                ));
            }
            LogRecord::CheckpointEnd { begin_lsn } => {
                info.detail = Some(format!("begin={}", begin_lsn.0));
            }
            LogRecord::FileOp(FileOp::Create {
                dict,
                name,
                comparator,
            }) => {
                info.dict = Some(dict.0);
                info.detail = Some(format!("create {name:?} comparator={comparator}"));
            }
            LogRecord::FileOp(FileOp::Remove { dict }) => {
                info.dict = Some(dict.0);
                info.detail = Some("remove".to_string());
            }
        }
        info
    }
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    from_lsn: u64,
    txn: Option<u64>,
    format: OutputFormat,
) -> CliResult<()> {
    let (_dir, provider) = open_offline(path)?;
    let reader = LogReader::open(provider)?;
    let records = read_records(&reader, limit, from_lsn, txn)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        OutputFormat::Text => {
            print_text_output(&records);
        }
    }

    Ok(())
}

fn read_records(
    reader: &LogReader,
    limit: Option<usize>,
    from_lsn: u64,
    txn: Option<u64>,
) -> CliResult<Vec<LogRecordInfo>> {
    let max_records = limit.unwrap_or(usize::MAX);
    let mut records = Vec::new();

    for &id in reader.file_ids() {
        let mut iter = reader.iter_file(id)?;
        for entry in iter.by_ref() {
            let entry = entry?;
            if entry.lsn.0 < from_lsn {
                continue;
            }
            if txn.is_some() && entry.record.txn().map(|t| t.0) != txn {
                continue;
            }
            records.push(LogRecordInfo::from_entry(&entry));
            if records.len() >= max_records {
                return Ok(records);
            }
        }
        if let Some(torn) = iter.torn_tail() {
            tracing::warn!(file = %torn.file, valid_len = torn.valid_len, reason = %torn.reason, "log ends in a damaged record");
        }
    }

    Ok(records)
}

fn print_text_output(records: &[LogRecordInfo]) {
    println!("Log Records ({} total)", records.len());
    println!("================");
    println!();

    for record in records {
        print!("[{:>8}] {:16}", record.lsn, record.kind);

        if let Some(txn) = record.txn {
            print!(" txn={}", txn);
        }
        if let Some(parent) = record.parent {
            print!(" parent={}", parent);
        }
        if let Some(dict) = record.dict {
            print!(" dict={}", dict);
        }
        if let Some(key) = &record.key {
            print!(" key={}", key);
        }
        if let Some(size) = record.value_size {
            print!(" value={}B", size);
        }
        if let Some(detail) = &record.detail {
            print!(" {}", detail);
        }
        println!("  ({}@{})", record.file, record.offset);
    }
}
