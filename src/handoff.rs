//! Public entry point.
//!
//! [`Handoff::start`] must be called early in `main`. In the original
//! invocation it becomes the supervisor: it spawns a child running the same
//! binary and only returns once that lineage of children has exited. In a
//! spawned child it returns immediately with an instance that can
//! [`update`](Handoff::update) the binary.

use crate::child::{log_error_sink, ChildRuntime, ErrorSink, Retirement, ShutdownHook};
use crate::config::HandoffConfig;
use crate::error::{Error, Result};
use crate::paths::BinaryPaths;
use crate::process::{OsProcessControl, CHILD_MARKER_ENV};
use crate::signal::SignalForwarder;
use crate::supervisor::Supervisor;
use crate::swap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Callback receiving the supervisor's final exit code.
pub type ExitCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// Whether this process was spawned by a supervisor.
pub fn child_marker_present() -> bool {
    std::env::var_os(CHILD_MARKER_ENV).map_or(false, |v| !v.is_empty())
}

/// Builder for [`Handoff`].
pub struct HandoffBuilder {
    config: HandoffConfig,
    shutdown_grace_time: Option<Duration>,
    exit_callback: ExitCallback,
    error_sink: ErrorSink,
}

impl Default for HandoffBuilder {
    fn default() -> Self {
        Self {
            config: HandoffConfig::default(),
            shutdown_grace_time: None,
            exit_callback: Arc::new(|code| std::process::exit(code)),
            error_sink: log_error_sink(),
        }
    }
}

impl HandoffBuilder {
    /// Use settings from a loaded configuration.
    pub fn config(mut self, config: HandoffConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the grace period given to a retiring child.
    pub fn shutdown_grace_time(mut self, grace: Duration) -> Self {
        self.shutdown_grace_time = Some(grace);
        self
    }

    /// Set what happens with the final exit code (default: exit the process).
    pub fn exit_callback(mut self, f: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.exit_callback = Arc::new(f);
        self
    }

    /// Set where failures of a background handoff are reported.
    pub fn error_sink(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.error_sink = Arc::new(f);
        self
    }

    fn grace(&self) -> Duration {
        self.shutdown_grace_time
            .unwrap_or_else(|| self.config.shutdown_grace_time())
    }

    /// Take on the supervisor or child role.
    pub async fn start(self) -> Result<Handoff> {
        self.start_as(child_marker_present()).await
    }

    async fn start_as(self, is_child: bool) -> Result<Handoff> {
        self.config.validate()?;
        if self.grace().is_zero() {
            return Err(Error::Config("shutdown grace time must be non-zero".to_string()));
        }

        let paths = BinaryPaths::resolve()?;

        if is_child {
            let child =
                ChildRuntime::new(paths.clone(), self.grace(), Arc::clone(&self.error_sink))?;
            return Ok(Handoff {
                is_child: true,
                paths,
                child: Some(child),
            });
        }

        info!(path = %paths.executable.display(), "Starting handoff supervisor");
        swap::handle_stale_backup(&paths.backup_path, self.config.reclaim_stale_backup);

        let events = SignalForwarder::new()?.spawn_forwarder();
        let supervisor = Supervisor::new(
            OsProcessControl::new(self.config.parent_death_signal),
            events,
            paths.backup_path.clone(),
            self.grace(),
            self.config.kill_backstop(),
        );

        let code = supervisor.run().await?;
        (self.exit_callback)(code);

        Ok(Handoff {
            is_child: false,
            paths,
            child: None,
        })
    }
}

/// A process taking part in the handoff protocol.
pub struct Handoff {
    is_child: bool,
    paths: BinaryPaths,
    child: Option<ChildRuntime>,
}

impl Handoff {
    /// Builder with default settings.
    pub fn builder() -> HandoffBuilder {
        HandoffBuilder::default()
    }

    /// Start with default settings.
    pub async fn start() -> Result<Self> {
        Self::builder().start().await
    }

    /// Whether this is a worker instance.
    pub fn is_child(&self) -> bool {
        self.is_child
    }

    /// Paths of the running binary.
    pub fn paths(&self) -> &BinaryPaths {
        &self.paths
    }

    /// Stage `binary` as the new executable and hand off once `hooks` succeed.
    ///
    /// Returns once the binary is staged. The handoff itself happens in the
    /// background.
    pub fn update(&self, binary: &[u8], hooks: Vec<ShutdownHook>) -> Result<()> {
        self.child.as_ref().ok_or(Error::NotChild)?.update(binary, hooks)
    }

    /// Notification for when the supervisor retires this child.
    pub fn retirement(&self) -> Result<Retirement> {
        Ok(self.child.as_ref().ok_or(Error::NotChild)?.retirement())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor_side() -> Handoff {
        Handoff {
            is_child: false,
            paths: BinaryPaths::resolve().unwrap(),
            child: None,
        }
    }

    #[test]
    fn test_update_on_supervisor_rejected() {
        let handoff = supervisor_side();
        assert!(matches!(
            handoff.update(b"v2", Vec::new()),
            Err(Error::NotChild)
        ));
        assert!(matches!(handoff.retirement(), Err(Error::NotChild)));
    }

    #[tokio::test]
    async fn test_child_role_is_fixed_at_start() {
        let handoff = Handoff::builder().start_as(true).await.unwrap();

        for _ in 0..3 {
            assert!(handoff.is_child());
        }
        assert!(!handoff.retirement().unwrap().is_retiring());
    }

    #[tokio::test]
    async fn test_zero_grace_rejected() {
        let result = Handoff::builder()
            .shutdown_grace_time(Duration::ZERO)
            .start()
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
