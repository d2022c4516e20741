//! CLI command implementations.

pub mod archive;
pub mod dump_log;
pub mod inspect;
pub mod recover;
pub mod verify;

use crate::{CliError, CliResult};
use rangedb_core::tree::IMAGE_FILE;
use rangedb_core::EnvDir;
use rangedb_storage::{BackendProvider, DirectoryProvider};
use std::path::Path;
use std::sync::Arc;

/// Locks an existing environment directory for offline reading.
///
/// The returned guard keeps a live environment from opening the directory
/// while the command reads it.
pub fn open_offline(path: &Path) -> CliResult<(EnvDir, Arc<dyn BackendProvider>)> {
    ensure_environment(path)?;
    let dir = EnvDir::open(path, false)?;
    let provider: Arc<dyn BackendProvider> = Arc::new(DirectoryProvider::new(path)?);
    Ok((dir, provider))
}

/// Fails unless the directory holds a log or a checkpoint image.
pub fn ensure_environment(path: &Path) -> CliResult<()> {
    if path.join("log").is_dir() || path.join(IMAGE_FILE).is_file() {
        Ok(())
    } else {
        Err(CliError::NotAnEnvironment(path.display().to_string()))
    }
}

/// Hex-encodes bytes for display.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Renders a key as text if printable, hex otherwise.
pub fn display_key(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if text.chars().all(|c| !c.is_control()) => format!("{text:?}"),
        _ => format!("0x{}", hex_encode(bytes)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use rangedb_core::{EnvConfig, Environment, IsolationLevel};
    use std::path::Path;

    /// Creates a closed environment holding a few committed rows.
    pub fn populated_env(path: &Path) {
        let env = Environment::open(path, EnvConfig::default()).unwrap();
        let db = env.open_db("users").unwrap();
        env.transaction(IsolationLevel::Serializable, |txn| {
            db.put(txn, b"alice", b"1")?;
            db.put(txn, b"bob", b"2")
        })
        .unwrap();
        env.close().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_render_as_text_or_hex() {
        assert_eq!(display_key(b"alice"), "\"alice\"");
        assert_eq!(display_key(&[0, 1, 0xff]), "0x0001ff");
    }

    #[test]
    fn offline_open_rejects_plain_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            open_offline(dir.path()),
            Err(CliError::NotAnEnvironment(_))
        ));
    }
}
