//! On-disk binary staging.
//!
//! A swap moves the live executable aside to the backup path and writes
//! the new bytes under the original name with the original permission bits.
//! Rename happens before the write, so a crash mid-write still leaves an
//! intact previous executable at the backup path. Until the write finishes
//! the live path is missing or partially written. That state is not repaired
//! automatically.

use crate::error::{Error, Result};
use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Stage `new_bytes` as the executable at `executable`.
///
/// Returns the backup path holding the previous binary.
pub fn stage(executable: &Path, backup_path: &Path, new_bytes: &[u8]) -> Result<PathBuf> {
    let mode = fs::metadata(executable)
        .map_err(|e| Error::swap(executable, e))?
        .permissions()
        .mode()
        & 0o7777;

    fs::rename(executable, backup_path).map_err(|e| Error::swap(backup_path, e))?;
    debug!(
        from = %executable.display(),
        to = %backup_path.display(),
        "Moved live executable to backup"
    );

    write_executable(executable, new_bytes, mode).map_err(|e| Error::swap(executable, e))?;

    info!(
        path = %executable.display(),
        bytes = new_bytes.len(),
        mode = format_args!("{:o}", mode),
        "Staged new executable"
    );
    Ok(backup_path.to_path_buf())
}

fn write_executable(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    // The umask may have narrowed the creation mode.
    fs::set_permissions(path, Permissions::from_mode(mode))
}

/// Delete the backup left behind by a completed swap.
pub fn reclaim(backup_path: &Path) -> Result<()> {
    fs::remove_file(backup_path).map_err(|e| Error::swap(backup_path, e))?;
    debug!(path = %backup_path.display(), "Reclaimed backup executable");
    Ok(())
}

/// Whether a backup from an earlier, unfinished swap is present.
pub fn stale_backup(backup_path: &Path) -> bool {
    backup_path.exists()
}

/// Check for an orphaned backup at startup, optionally removing it.
pub fn handle_stale_backup(backup_path: &Path, remove: bool) {
    if !stale_backup(backup_path) {
        return;
    }

    if remove {
        match reclaim(backup_path) {
            Ok(()) => info!(path = %backup_path.display(), "Removed stale backup executable"),
            Err(e) => warn!(error = %e, "Failed to remove stale backup executable"),
        }
    } else {
        warn!(
            path = %backup_path.display(),
            "Found backup executable from an unfinished swap, leaving it in place"
        );
    }
}
