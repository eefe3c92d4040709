//! Error types for the handoff protocol.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for handoff operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while supervising or replacing a process.
#[derive(Error, Debug)]
pub enum Error {
    /// The running executable could not be located or stat'ed
    #[error("Failed to resolve executable {name}: {reason}")]
    Resolution { name: String, reason: String },

    /// Rename, write or removal failed while staging or reclaiming a binary
    #[error("Binary swap failed at {}: {reason}", path.display())]
    Swap { path: PathBuf, reason: String },

    /// The successor process could not be created
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    /// A child's exit could not be observed
    #[error("Failed to wait for PID {pid}: {reason}")]
    Wait { pid: i32, reason: String },

    /// A caller-supplied shutdown hook failed
    #[error("Shutdown hook #{index} ({name}) failed: {reason}")]
    Hook {
        index: usize,
        name: String,
        reason: String,
    },

    /// Binary content does not match the expected digest
    #[error("Mismatching checksums: expected `{expected}`, got `{actual}`")]
    ChecksumMismatch { expected: String, actual: String },

    /// Signal delivery or subscription failed
    #[error("Signal error: {0}")]
    Signal(String),

    /// Operation is only valid inside a child instance
    #[error("Operation requires a child instance, but this is the supervisor")]
    NotChild,

    /// An update is already being handed off
    #[error("An update is already in flight")]
    UpdateInFlight,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Create a swap error for a path.
    pub fn swap(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Swap {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a wait error for a PID.
    pub fn wait(pid: i32, reason: impl ToString) -> Self {
        Error::Wait {
            pid,
            reason: reason.to_string(),
        }
    }
}
