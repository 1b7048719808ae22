//! Atomic file write utility.
//!
//! Write-to-temp-then-rename, used for every cache info row so a crash
//! mid-write never leaves a torn record behind.
//!
//! Invariants:
//! - Write goes to a `.tmp` sibling first, then an atomic rename replaces the target.
//! - On rename failure, the temp file is cleaned up.
//! - Parent directories are created if absent.

use std::path::Path;
use tokio::fs;
use tracing::error;

/// Atomically write `content` to `path` via a temporary file and rename.
pub async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    fs::write(&tmp_path, content).await.map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    if let Err(e) = fs::rename(&tmp_path, path).await {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    Ok(())
}
