//! RangeDB CLI
//!
//! Command-line tools for RangeDB environment maintenance.
//!
//! # Commands
//!
//! - `inspect` - Show the checkpoint image and log files without opening
//! - `verify` - Check log checksums, LSN continuity and the image
//! - `dump-log` - Print log records for debugging
//! - `recover` - Open the environment, run recovery and report
//! - `archive` - Checkpoint and list or remove unneeded log files

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Errors reported by the CLI itself.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The command needs `--path`.
    #[error("environment path required for {0}")]
    MissingPath(&'static str),

    /// Nothing that looks like an environment lives at the path.
    #[error("no environment found at {0}")]
    NotAnEnvironment(String),

    /// Verification found damage.
    #[error("verification failed with {0} problem(s)")]
    VerifyFailed(usize),

    /// Engine error.
    #[error(transparent)]
    Core(#[from] rangedb_core::CoreError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] rangedb_storage::StorageError),

    /// JSON output failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Output format for reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// RangeDB command-line environment tools.
#[derive(Parser)]
#[command(name = "rangedb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the environment directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the checkpoint image and log files
    Inspect {
        /// List every dictionary with its key count
        #[arg(short, long)]
        dictionaries: bool,

        /// List every log file
        #[arg(short, long)]
        logs: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Verify log and image integrity
    Verify {
        /// Check the log files
        #[arg(short, long)]
        log: bool,

        /// Check the checkpoint image
        #[arg(short, long)]
        image: bool,
    },

    /// Dump log records for debugging
    DumpLog {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip records below this LSN
        #[arg(long, default_value = "0")]
        from_lsn: u64,

        /// Only records of this transaction
        #[arg(short, long)]
        txn: Option<u64>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Open the environment, run recovery and report what it did
    Recover {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Checkpoint, then list or remove log files recovery no longer needs
    Archive {
        /// Only list the files
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect {
            dictionaries,
            logs,
            format,
        } => {
            let path = cli.path.ok_or(CliError::MissingPath("inspect"))?;
            commands::inspect::run(&path, dictionaries, logs, format)?;
        }
        Commands::Verify { log, image } => {
            let path = cli.path.ok_or(CliError::MissingPath("verify"))?;
            let check_all = !log && !image;
            commands::verify::run(&path, log || check_all, image || check_all)?;
        }
        Commands::DumpLog {
            limit,
            from_lsn,
            txn,
            format,
        } => {
            let path = cli.path.ok_or(CliError::MissingPath("dump-log"))?;
            commands::dump_log::run(&path, limit, from_lsn, txn, format)?;
        }
        Commands::Recover { format } => {
            let path = cli.path.ok_or(CliError::MissingPath("recover"))?;
            commands::recover::run(&path, format)?;
        }
        Commands::Archive { dry_run } => {
            let path = cli.path.ok_or(CliError::MissingPath("archive"))?;
            commands::archive::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("RangeDB CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
