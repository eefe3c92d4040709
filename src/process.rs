//! Process control for the supervisor.
//!
//! The supervisor only ever needs three operations on its children: spawn
//! one, signal one, and poll one for exit. [`ProcessControl`] captures them
//! so the supervisor state machine can run against fakes in tests.

use crate::error::{Error, Result};
use crate::paths::BinaryPaths;
use crate::signal::{self, ControlSignal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Environment variable marking a spawned worker instance.
pub const CHILD_MARKER_ENV: &str = "BUCKOS_HANDOFF_CHILD";

/// Exit status of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Process ID
    pub pid: i32,
    /// Exit code (if exited normally)
    pub code: Option<i32>,
    /// Signal (if killed by signal)
    pub signal: Option<i32>,
}

impl ChildExit {
    /// Exit code to propagate, using the shell convention for signals.
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => 1,
        }
    }
}

/// Operations the supervisor performs on child processes.
pub trait ProcessControl {
    /// Spawn a new child from the current executable, returning its PID.
    fn spawn(&mut self) -> Result<i32>;

    /// Deliver a control signal to a child.
    fn signal(&mut self, pid: i32, sig: ControlSignal) -> Result<()>;

    /// Reap a specific child without blocking.
    fn try_wait(&mut self, pid: i32) -> Result<Option<ChildExit>>;
}

/// [`ProcessControl`] backed by real OS processes.
#[derive(Debug, Clone)]
pub struct OsProcessControl {
    /// Arguments of the original invocation, argv[0] included
    args: Vec<OsString>,
    /// Ask the kernel to SIGTERM children when the supervisor dies
    parent_death_signal: bool,
}

impl OsProcessControl {
    /// Create a controller that re-runs the current invocation.
    pub fn new(parent_death_signal: bool) -> Self {
        Self::with_args(std::env::args_os().collect(), parent_death_signal)
    }

    /// Create a controller for an explicit argument vector.
    pub fn with_args(args: Vec<OsString>, parent_death_signal: bool) -> Self {
        Self {
            args,
            parent_death_signal,
        }
    }
}

impl ProcessControl for OsProcessControl {
    fn spawn(&mut self) -> Result<i32> {
        let argv0 = self
            .args
            .first()
            .cloned()
            .ok_or_else(|| Error::Spawn("empty argument vector".to_string()))?;

        // The binary may have been swapped since startup.
        let paths = BinaryPaths::resolve_from(&argv0)?;

        let mut cmd = Command::new(&paths.executable);
        cmd.arg0(&argv0)
            .args(&self.args[1..])
            .current_dir(&paths.working_dir)
            .env(CHILD_MARKER_ENV, "TRUE")
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if self.parent_death_signal {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|e| {
            Error::Spawn(format!("{}: {}", paths.executable.display(), e))
        })?;

        // Reaping goes through waitpid, the handle is not needed.
        let pid = child.id() as i32;
        info!(pid = pid, path = %paths.executable.display(), "Spawned child process");
        Ok(pid)
    }

    fn signal(&mut self, pid: i32, sig: ControlSignal) -> Result<()> {
        signal::send(pid, sig)
    }

    fn try_wait(&mut self, pid: i32) -> Result<Option<ChildExit>> {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                debug!(pid = pid, code = code, "Reaped child process");
                Ok(Some(ChildExit {
                    pid,
                    code: Some(code),
                    signal: None,
                }))
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                debug!(pid = pid, signal = ?sig, "Reaped signaled child process");
                Ok(Some(ChildExit {
                    pid,
                    code: None,
                    signal: Some(sig as i32),
                }))
            }
            Ok(_) => Ok(None),
            Err(e) => Err(Error::wait(pid, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_normal() {
        let exit = ChildExit {
            pid: 10,
            code: Some(3),
            signal: None,
        };
        assert_eq!(exit.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_signaled() {
        let exit = ChildExit {
            pid: 10,
            code: None,
            signal: Some(9),
        };
        assert_eq!(exit.exit_code(), 137);
    }

    #[test]
    fn test_spawn_and_reap_real_process() {
        let mut control = OsProcessControl::with_args(
            vec![OsString::from("/bin/sh"), OsString::from("-c"), OsString::from("exit 7")],
            false,
        );
        let pid = control.spawn().unwrap();

        let exit = loop {
            if let Some(exit) = control.try_wait(pid).unwrap() {
                break exit;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        assert_eq!(exit.pid, pid);
        assert_eq!(exit.exit_code(), 7);

        // Already reaped, so the kernel no longer knows it.
        assert!(matches!(control.try_wait(pid), Err(Error::Wait { .. })));
    }

    #[test]
    fn test_spawn_missing_executable() {
        let mut control =
            OsProcessControl::with_args(vec![OsString::from("/nonexistent/handoff")], false);
        assert!(matches!(control.spawn(), Err(Error::Resolution { .. })));
    }
}
