//! Buckos handoff - in-place binary replacement for long-running services.
//!
//! A service links this crate and calls [`Handoff::start`] at the top of
//! `main`. The original invocation becomes a small supervisor that spawns the
//! real service as its child. When the child receives a new binary it stages
//! it over its own executable, runs its shutdown hooks, and asks the
//! supervisor to replace it. The supervisor spawns the successor from the new
//! binary, retires the old child, and removes the backup. There is no external
//! process manager and no restart of the supervisor.
//!
//! # Architecture
//!
//! - **paths**: locates the running executable and its backup path
//! - **swap**: stages and reclaims binaries on disk
//! - **signal**: the signal vocabulary and the supervisor event queue
//! - **child**: update entry point, shutdown hooks, retirement
//! - **supervisor**: the `Waiting` / `Replacing` / `Done` state machine
//! - **checksum**: optional SHA-256 verification for callers
//!
//! # Example
//!
//! ```no_run
//! use buckos_handoff::{Handoff, ShutdownHook};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handoff = Handoff::start().await?;
//!
//!     // Only the child gets here.
//!     let new_binary = std::fs::read("/tmp/service.new")?;
//!     buckos_handoff::checksum::verify(&new_binary, "2cf24d...")?;
//!     handoff.update(
//!         &new_binary,
//!         vec![ShutdownHook::new("drain", || async { Ok(()) })],
//!     )?;
//!
//!     handoff.retirement()?.wait().await;
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod child;
pub mod config;
pub mod error;
pub mod handoff;
pub mod paths;
pub mod process;
pub mod signal;
pub mod supervisor;
pub mod swap;

// Re-export main types
pub use child::{ChildRuntime, ProcessLink, Retirement, ShutdownHook};
pub use config::HandoffConfig;
pub use error::{Error, Result};
pub use handoff::{Handoff, HandoffBuilder};
pub use paths::BinaryPaths;
pub use process::{ChildExit, OsProcessControl, ProcessControl, CHILD_MARKER_ENV};
pub use signal::{ControlSignal, SupervisorEvent};
pub use supervisor::{Supervisor, SupervisorState};
