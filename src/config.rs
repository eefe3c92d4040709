//! Handoff configuration.
//!
//! Configuration can be loaded from a TOML file; every field has a default
//! so an empty file is valid.
//!
//! ```toml
//! shutdown_grace_secs = 30
//! kill_backstop_secs = 5
//! reclaim_stale_backup = false
//! parent_death_signal = true
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default time a retiring child gets before it is forcibly terminated.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 15;

/// Default extra time the supervisor waits past the grace period before
/// killing a retiring child itself.
pub const DEFAULT_KILL_BACKSTOP_SECS: u64 = 5;

/// Tunables for the supervisor and child runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Grace period after graceful-terminate, in seconds
    pub shutdown_grace_secs: u64,
    /// Supervisor-side margin past the grace period, in seconds
    pub kill_backstop_secs: u64,
    /// Remove a backup left by an interrupted swap on startup
    pub reclaim_stale_backup: bool,
    /// Have children receive SIGTERM if the supervisor dies (Linux only)
    pub parent_death_signal: bool,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            kill_backstop_secs: DEFAULT_KILL_BACKSTOP_SECS,
            reclaim_stale_backup: false,
            parent_death_signal: true,
        }
    }
}

impl HandoffConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.shutdown_grace_secs == 0 {
            return Err(Error::Config(
                "shutdown_grace_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Grace period as a duration.
    pub fn shutdown_grace_time(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Backstop margin as a duration.
    pub fn kill_backstop(&self) -> Duration {
        Duration::from_secs(self.kill_backstop_secs)
    }
}
