//! Executable path resolution.
//!
//! Both the supervisor and the child need to know where their own binary
//! lives on disk: the child to stage a replacement over it, the supervisor to
//! spawn from it and to reclaim the backup afterwards.

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// File name of the backup kept next to the executable while a swap is in flight.
pub const BACKUP_FILENAME: &str = ".replace.tmp";

/// Resolved on-disk locations for the running binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPaths {
    /// Absolute path of the executable
    pub executable: PathBuf,
    /// Working directory at startup
    pub working_dir: PathBuf,
    /// Sibling backup file used during a swap
    pub backup_path: PathBuf,
}

impl BinaryPaths {
    /// Resolve paths for the current process from its invocation name.
    pub fn resolve() -> Result<Self> {
        let argv0 = std::env::args_os().next().ok_or_else(|| Error::Resolution {
            name: String::new(),
            reason: "process has no argv[0]".to_string(),
        })?;
        Self::resolve_from(&argv0)
    }

    /// Resolve paths for an arbitrary invocation name.
    ///
    /// Bare names are looked up through `PATH`, anything containing a path
    /// separator is taken relative to the working directory.
    pub fn resolve_from(argv0: &OsStr) -> Result<Self> {
        let name = argv0.to_string_lossy().into_owned();
        let resolution = |reason: String| Error::Resolution {
            name: name.clone(),
            reason,
        };

        let working_dir = std::env::current_dir().map_err(|e| resolution(e.to_string()))?;

        let candidate = Path::new(argv0);
        let located = if candidate.components().count() > 1 || candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            which::which(argv0).map_err(|e| resolution(e.to_string()))?
        };

        let executable = if located.is_absolute() {
            located
        } else {
            working_dir.join(located)
        };

        std::fs::metadata(&executable).map_err(|e| resolution(e.to_string()))?;

        let backup_path = backup_path_for(&executable, &working_dir);

        Ok(Self {
            executable,
            working_dir,
            backup_path,
        })
    }
}

/// Backup location for a given executable.
pub fn backup_path_for(executable: &Path, working_dir: &Path) -> PathBuf {
    executable
        .parent()
        .unwrap_or(working_dir)
        .join(BACKUP_FILENAME)
}
