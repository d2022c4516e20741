//! Write-ahead log.
//!
//! The log is a sequence of numbered files under `log/`. Each file starts
//! with a header naming its number and the LSN of its first record, so LSNs
//! continue unbroken across files.
//!
//! ## Record format
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | length (4) | lsn (8) | payload (N) | crc32 (4) |
//! ```
//!
//! The CRC covers everything before it.

mod reader;
mod record;
mod writer;

pub use reader::{LogEntry, LogFileInfo, LogFileIter, LogReader, LogScan, TornTail};
pub use record::{
    compute_crc32, encode_record, FileOp, LogFileHeader, LogRecord, LogRecordKind, OpenTxn,
    FILE_HEADER_SIZE, FILE_MAGIC, LOG_VERSION, RECORD_MAGIC,
};
pub use writer::LogWriter;
