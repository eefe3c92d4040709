//! Signal vocabulary shared by the supervisor and its child.
//!
//! Signals carry no payload, so each one is given exactly one meaning:
//!
//! - SIGUSR2: the child staged a new binary and wants to be replaced
//! - SIGCHLD: a child of the supervisor exited
//! - SIGTERM: the supervisor asks a child to shut down
//! - SIGKILL: unconditional termination after the grace period
//!
//! The supervisor never handles raw interrupts. [`SignalForwarder`] turns the
//! two inbound signals into [`SupervisorEvent`]s on one ordered queue, which
//! is also how tests drive the supervisor without raising real signals.

use crate::error::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of the supervisor event queue.
const EVENT_QUEUE_CAPACITY: usize = 32;

/// Control signals exchanged between the two processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    /// Child to supervisor: spawn my successor and retire me
    RestartRequest,
    /// OS to supervisor: a child terminated
    ChildExited,
    /// Supervisor to child: begin shutting down
    GracefulTerminate,
    /// Terminate unconditionally
    ForcedTerminate,
}

impl ControlSignal {
    /// OS signal carrying this meaning.
    pub fn os_signal(self) -> Signal {
        match self {
            ControlSignal::RestartRequest => Signal::SIGUSR2,
            ControlSignal::ChildExited => Signal::SIGCHLD,
            ControlSignal::GracefulTerminate => Signal::SIGTERM,
            ControlSignal::ForcedTerminate => Signal::SIGKILL,
        }
    }

    /// Map an OS signal back to its protocol meaning.
    pub fn from_os_signal(sig: Signal) -> Option<Self> {
        match sig {
            Signal::SIGUSR2 => Some(ControlSignal::RestartRequest),
            Signal::SIGCHLD => Some(ControlSignal::ChildExited),
            Signal::SIGTERM => Some(ControlSignal::GracefulTerminate),
            Signal::SIGKILL => Some(ControlSignal::ForcedTerminate),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlSignal::RestartRequest => write!(f, "restart-request"),
            ControlSignal::ChildExited => write!(f, "child-exited"),
            ControlSignal::GracefulTerminate => write!(f, "graceful-terminate"),
            ControlSignal::ForcedTerminate => write!(f, "forced-terminate"),
        }
    }
}

/// Inbound events processed by the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The active child asked to be replaced (SIGUSR2)
    RestartRequested,
    /// Some child exited (SIGCHLD); statuses must be polled per PID
    ChildExited,
}

/// Deliver a control signal to a process.
pub fn send(pid: i32, sig: ControlSignal) -> Result<()> {
    kill(Pid::from_raw(pid), sig.os_signal())
        .map_err(|e| Error::Signal(format!("failed to send {} to PID {}: {}", sig, pid, e)))?;
    debug!(pid = pid, signal = %sig, "Sent control signal");
    Ok(())
}

/// Subscription to the supervisor's inbound signals.
pub struct SignalForwarder {
    sigusr2: tokio::signal::unix::Signal,
    sigchld: tokio::signal::unix::Signal,
}

impl SignalForwarder {
    /// Subscribe to SIGUSR2 and SIGCHLD.
    ///
    /// Must be called before the first child is spawned so that an early
    /// exit is not missed.
    pub fn new() -> Result<Self> {
        Ok(Self {
            sigusr2: signal(SignalKind::user_defined2())?,
            sigchld: signal(SignalKind::child())?,
        })
    }

    /// Wait for the next inbound signal.
    ///
    /// Returns `None` once either signal stream has closed.
    pub async fn wait(&mut self) -> Option<SupervisorEvent> {
        tokio::select! {
            sig = self.sigusr2.recv() => sig.map(|()| SupervisorEvent::RestartRequested),
            sig = self.sigchld.recv() => sig.map(|()| SupervisorEvent::ChildExited),
        }
    }

    /// Spawn a task that forwards signals to a channel.
    pub fn spawn_forwarder(mut self) -> mpsc::Receiver<SupervisorEvent> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        tokio::spawn(async move {
            loop {
                let event = self.wait().await;
                if !forward(event, &tx).await {
                    break;
                }
            }
        });

        rx
    }
}

/// Forward one event, returning whether forwarding should go on.
async fn forward(event: Option<SupervisorEvent>, tx: &mpsc::Sender<SupervisorEvent>) -> bool {
    match event {
        Some(event) => tx.send(event).await.is_ok(),
        None => {
            debug!("Signal stream closed, stopping forwarder");
            false
        }
    }
}
