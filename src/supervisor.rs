//! Supervisor-side half of the handoff protocol.
//!
//! The supervisor never runs host logic. It spawns one child, then blocks on
//! its event queue:
//!
//! ```text
//!            child-exited(active)
//!   Waiting ----------------------> Done(code)
//!     |  ^
//!     |  | old child reaped, backup reclaimed
//!     v  |
//!   Replacing
//!     ^
//!     restart-request
//! ```
//!
//! All state lives in [`Supervisor`] and is only touched by its own loop,
//! one event at a time.

use crate::error::{Error, Result};
use crate::process::{ChildExit, ProcessControl};
use crate::signal::{ControlSignal, SupervisorEvent};
use crate::swap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle state of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// One child is active, waiting for it to exit or ask for replacement
    Waiting,
    /// A successor is running and the old child is being retired
    Replacing,
    /// The active child exited on its own; the run is over
    Done(i32),
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Waiting => write!(f, "waiting"),
            SupervisorState::Replacing => write!(f, "replacing"),
            SupervisorState::Done(code) => write!(f, "done({})", code),
        }
    }
}

/// Master process managing exactly one active child.
pub struct Supervisor<P> {
    control: P,
    events: mpsc::Receiver<SupervisorEvent>,
    backup_path: PathBuf,
    shutdown_grace_time: Duration,
    kill_backstop: Duration,
    active: Option<i32>,
    state: SupervisorState,
    deferred_restart: bool,
}

impl<P: ProcessControl> Supervisor<P> {
    /// Create a supervisor reading events from `events`.
    pub fn new(
        control: P,
        events: mpsc::Receiver<SupervisorEvent>,
        backup_path: PathBuf,
        shutdown_grace_time: Duration,
        kill_backstop: Duration,
    ) -> Self {
        Self {
            control,
            events,
            backup_path,
            shutdown_grace_time,
            kill_backstop,
            active: None,
            state: SupervisorState::Waiting,
            deferred_restart: false,
        }
    }

    /// PID of the active child, once one has been spawned.
    pub fn active_pid(&self) -> Option<i32> {
        self.active
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Spawn the first child and process events until it exits on its own.
    ///
    /// Returns the exit code of the last child that terminated outside the
    /// update protocol.
    pub async fn run(mut self) -> Result<i32> {
        let mut active = self.control.spawn()?;
        self.active = Some(active);
        self.state = SupervisorState::Waiting;
        info!(pid = active, "Supervising child process");

        loop {
            if let SupervisorState::Done(code) = self.state {
                info!(code = code, "Supervised run finished");
                return Ok(code);
            }

            let event = if std::mem::take(&mut self.deferred_restart) {
                SupervisorEvent::RestartRequested
            } else {
                self.events
                    .recv()
                    .await
                    .ok_or_else(|| Error::Signal("supervisor event queue closed".to_string()))?
            };

            debug!(event = ?event, state = %self.state, "Handling supervisor event");
            match event {
                SupervisorEvent::ChildExited => self.poll_active(active)?,
                SupervisorEvent::RestartRequested => {
                    active = self.replace(active).await?;
                    self.active = Some(active);
                }
            }
        }
    }

    fn poll_active(&mut self, pid: i32) -> Result<()> {
        match self.control.try_wait(pid)? {
            Some(exit) => {
                info!(
                    pid = pid,
                    code = ?exit.code,
                    signal = ?exit.signal,
                    "Active child exited"
                );
                self.state = SupervisorState::Done(exit.exit_code());
            }
            None => debug!(pid = pid, "Child-exited did not concern the active child"),
        }
        Ok(())
    }

    /// Spawn a successor, retire `old` and reclaim the backup.
    ///
    /// Returns the PID of the promoted successor.
    async fn replace(&mut self, old: i32) -> Result<i32> {
        self.state = SupervisorState::Replacing;
        info!(pid = old, "Restart requested, spawning successor");

        let pending = self.control.spawn()?;
        self.control.signal(old, ControlSignal::GracefulTerminate)?;

        let pending_exit = self.wait_for_retirement(old, pending).await?;

        if let Err(e) = swap::reclaim(&self.backup_path) {
            warn!(error = %e, "Failed to reclaim backup executable");
        }

        info!(old = old, new = pending, "Handoff complete");

        self.state = match pending_exit {
            Some(exit) => {
                warn!(pid = pending, code = exit.exit_code(), "Successor exited during handoff");
                SupervisorState::Done(exit.exit_code())
            }
            None => SupervisorState::Waiting,
        };
        Ok(pending)
    }

    /// Block until `old` is reaped, keeping track of whether `pending`
    /// exited meanwhile.
    async fn wait_for_retirement(&mut self, old: i32, pending: i32) -> Result<Option<ChildExit>> {
        let backstop = tokio::time::sleep(self.shutdown_grace_time + self.kill_backstop);
        tokio::pin!(backstop);
        let mut forced = false;
        let mut pending_exit = None;

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(SupervisorEvent::ChildExited) => {
                        if pending_exit.is_none() {
                            pending_exit = self.control.try_wait(pending)?;
                        }
                        if let Some(exit) = self.control.try_wait(old)? {
                            debug!(pid = old, code = exit.exit_code(), "Retired child exited");
                            return Ok(pending_exit);
                        }
                    }
                    Some(SupervisorEvent::RestartRequested) => {
                        debug!("Deferring restart request until handoff completes");
                        self.deferred_restart = true;
                    }
                    None => return Err(Error::wait(old, "supervisor event queue closed")),
                },
                _ = &mut backstop, if !forced => {
                    warn!(pid = old, "Retiring child outlived its grace period, killing it");
                    self.control.signal(old, ControlSignal::ForcedTerminate)?;
                    forced = true;
                }
            }
        }
    }
}
