//! Global data directory for persistent storage.
//!
//! Defaults to `~/.peerdrop/` but can be overridden via `--data-dir`.
//! Initialized once at startup via `init()`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the global data directory.
///
/// If `custom` is `Some`, uses that path, otherwise `~/.peerdrop/`. A second
/// call keeps the first value and returns it.
pub fn init(custom: Option<&Path>) -> anyhow::Result<&'static Path> {
    let dir = match custom {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("No home directory found"))?
            .join(".peerdrop"),
    };
    Ok(DATA_DIR.get_or_init(|| dir).as_path())
}

/// Returns the data directory, or `None` before `init()`.
pub fn get() -> Option<&'static Path> {
    DATA_DIR.get().map(PathBuf::as_path)
}

/// Default chunk cache root under the data directory.
pub fn cache_root(data_dir: &Path) -> PathBuf {
    data_dir.join("cache")
}

/// Log file location under the data directory.
pub fn log_file(data_dir: &Path) -> PathBuf {
    data_dir.join("logs").join("peerdrop.log")
}
