//! Child-side half of the handoff protocol.
//!
//! The child owns the public update entry point. An update is split in two:
//!
//! 1. [`ChildRuntime::update`] stages the new binary and returns as soon as
//!    the bytes are on disk.
//! 2. A detached continuation runs the shutdown hooks in order, asks the
//!    supervisor for a replacement, and then waits to be retired.
//!
//! A failing hook aborts the continuation before the supervisor is ever
//! signalled, so the running child keeps serving.

use crate::error::{Error, Result};
use crate::paths::BinaryPaths;
use crate::signal::{self, ControlSignal};
use crate::swap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Future returned by a shutdown hook.
pub type HookFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Future resolving once graceful-terminate has been received.
pub type TerminateFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback receiving failures of the detached update continuation.
pub type ErrorSink = Arc<dyn Fn(&Error) + Send + Sync>;

/// Default error sink: log and carry on serving.
pub fn log_error_sink() -> ErrorSink {
    Arc::new(|e: &Error| error!(error = %e, "Update handoff aborted"))
}

/// A caller-supplied action run before the supervisor is asked for a
/// replacement, e.g. draining a listener or flushing state.
pub struct ShutdownHook {
    name: String,
    run: Box<dyn FnOnce() -> HookFuture + Send>,
}

impl ShutdownHook {
    /// Create a hook from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move || Box::pin(f())),
        }
    }

    /// Create a hook from a blocking closure, run on the blocking pool.
    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self::new(name, move || async move {
            match tokio::task::spawn_blocking(f).await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("hook task failed: {}", e)),
            }
        })
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(self) -> anyhow::Result<()> {
        (self.run)().await
    }
}

impl fmt::Debug for ShutdownHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHook").field("name", &self.name).finish()
    }
}

/// The child's view of its own process and of the supervisor.
pub trait ProcessLink: Send + Sync {
    /// Start listening for graceful-terminate.
    fn subscribe_terminate(&self) -> Result<TerminateFuture>;

    /// Send restart-request to the supervisor.
    fn request_restart(&self) -> Result<()>;

    /// Send forced-terminate to this process.
    fn force_terminate(&self) -> Result<()>;

    /// Exit this process immediately.
    fn exit(&self, code: i32);
}

/// [`ProcessLink`] for a real child of the supervisor.
#[derive(Debug, Clone)]
pub struct ParentLink {
    supervisor_pid: u32,
}

impl ParentLink {
    /// Link to the current parent process.
    pub fn new() -> Self {
        Self {
            supervisor_pid: std::os::unix::process::parent_id(),
        }
    }
}

impl Default for ParentLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLink for ParentLink {
    fn subscribe_terminate(&self) -> Result<TerminateFuture> {
        let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
        Ok(Box::pin(async move {
            sigterm.recv().await;
        }))
    }

    fn request_restart(&self) -> Result<()> {
        // Reparented to init: the supervisor is gone.
        if std::os::unix::process::parent_id() != self.supervisor_pid {
            return Err(Error::Signal(format!(
                "supervisor PID {} is no longer our parent",
                self.supervisor_pid
            )));
        }
        signal::send(self.supervisor_pid as i32, ControlSignal::RestartRequest)
    }

    fn force_terminate(&self) -> Result<()> {
        signal::send(std::process::id() as i32, ControlSignal::ForcedTerminate)
    }

    fn exit(&self, code: i32) {
        std::process::exit(code)
    }
}

/// Notification that the supervisor has asked this child to shut down.
#[derive(Debug, Clone)]
pub struct Retirement {
    rx: watch::Receiver<bool>,
}

impl Retirement {
    /// Wait until graceful-terminate has been received.
    pub async fn wait(&mut self) {
        // A closed channel means the runtime is gone and nothing will
        // ever retire us.
        if self.rx.wait_for(|retiring| *retiring).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Whether graceful-terminate has been received.
    pub fn is_retiring(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Runtime state of a worker instance.
pub struct ChildRuntime {
    paths: BinaryPaths,
    shutdown_grace_time: Duration,
    link: Arc<dyn ProcessLink>,
    error_sink: ErrorSink,
    handle: Handle,
    in_flight: Arc<AtomicBool>,
    retirement: Arc<watch::Sender<bool>>,
}

impl ChildRuntime {
    /// Create the runtime for a real child process.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        paths: BinaryPaths,
        shutdown_grace_time: Duration,
        error_sink: ErrorSink,
    ) -> Result<Self> {
        Self::with_link(
            paths,
            shutdown_grace_time,
            error_sink,
            Arc::new(ParentLink::new()),
        )
    }

    /// Create the runtime with a custom process link.
    pub fn with_link(
        paths: BinaryPaths,
        shutdown_grace_time: Duration,
        error_sink: ErrorSink,
        link: Arc<dyn ProcessLink>,
    ) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("child runtime needs a tokio runtime: {}", e)))?;
        let (retirement, _) = watch::channel(false);

        Ok(Self {
            paths,
            shutdown_grace_time,
            link,
            error_sink,
            handle,
            in_flight: Arc::new(AtomicBool::new(false)),
            retirement: Arc::new(retirement),
        })
    }

    /// Paths of the running binary.
    pub fn paths(&self) -> &BinaryPaths {
        &self.paths
    }

    /// Subscribe to retirement notification.
    pub fn retirement(&self) -> Retirement {
        Retirement {
            rx: self.retirement.subscribe(),
        }
    }

    /// Stage `binary` and hand off to a new instance once `hooks` succeed.
    ///
    /// Returns after staging; the hooks and the restart request run in the
    /// background. Their failures go to the error sink.
    pub fn update(&self, binary: &[u8], hooks: Vec<ShutdownHook>) -> Result<()> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(Error::UpdateInFlight);
        }

        if let Err(e) = swap::stage(&self.paths.executable, &self.paths.backup_path, binary) {
            self.in_flight.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let continuation = Continuation {
            shutdown_grace_time: self.shutdown_grace_time,
            link: Arc::clone(&self.link),
            in_flight: Arc::clone(&self.in_flight),
            retirement: Arc::clone(&self.retirement),
        };
        let error_sink = Arc::clone(&self.error_sink);

        self.handle.spawn(async move {
            if let Err(e) = continuation.run(hooks).await {
                error_sink(&e);
            }
        });

        Ok(())
    }
}

/// The detached part of an update.
struct Continuation {
    shutdown_grace_time: Duration,
    link: Arc<dyn ProcessLink>,
    in_flight: Arc<AtomicBool>,
    retirement: Arc<watch::Sender<bool>>,
}

impl Continuation {
    async fn run(self, hooks: Vec<ShutdownHook>) -> Result<()> {
        let terminated = match self.request_handoff(hooks).await {
            Ok(terminated) => terminated,
            Err(e) => {
                // Nothing was sent; a later update may try again.
                self.in_flight.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        terminated.await;
        self.retire().await
    }

    async fn request_handoff(&self, hooks: Vec<ShutdownHook>) -> Result<TerminateFuture> {
        run_hooks(hooks).await?;

        let terminated = self.link.subscribe_terminate()?;
        self.link.request_restart()?;
        info!("Requested replacement from supervisor");

        Ok(terminated)
    }

    async fn retire(&self) -> Result<()> {
        info!("Received graceful-terminate, retiring");
        self.retirement.send_replace(true);

        if self.retirement.receiver_count() == 0 {
            debug!("No retirement listener, exiting now");
            self.link.exit(0);
            return Ok(());
        }

        tokio::time::sleep(self.shutdown_grace_time).await;
        warn!(
            grace_secs = self.shutdown_grace_time.as_secs_f64(),
            "Grace period elapsed, forcing termination"
        );
        self.link.force_terminate()
    }
}

/// Run hooks strictly in order, stopping at the first failure.
async fn run_hooks(hooks: Vec<ShutdownHook>) -> Result<()> {
    for (index, hook) in hooks.into_iter().enumerate() {
        let name = hook.name().to_string();
        debug!(hook = %name, index = index, "Running shutdown hook");

        hook.run().await.map_err(|e| Error::Hook {
            index,
            name,
            reason: format!("{:#}", e),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::BACKUP_FILENAME;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, Notify};
    use tokio::time::Instant;

    #[derive(Default)]
    struct FakeLink {
        restarts: AtomicUsize,
        forced: AtomicUsize,
        exits: Mutex<Vec<i32>>,
        terminate: Arc<Notify>,
        fail_restart: bool,
    }

    impl ProcessLink for FakeLink {
        fn subscribe_terminate(&self) -> Result<TerminateFuture> {
            let terminate = Arc::clone(&self.terminate);
            Ok(Box::pin(async move { terminate.notified().await }))
        }

        fn request_restart(&self) -> Result<()> {
            if self.fail_restart {
                return Err(Error::Signal("supervisor gone".to_string()));
            }
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn force_terminate(&self) -> Result<()> {
            self.forced.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn exit(&self, code: i32) {
            self.exits.lock().unwrap().push(code);
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: BinaryPaths,
        link: Arc<FakeLink>,
        errors: mpsc::UnboundedReceiver<String>,
        runtime: ChildRuntime,
    }

    fn fixture(link: FakeLink, grace: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("worker");
        std::fs::write(&exe, b"v1").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let paths = BinaryPaths {
            executable: exe,
            working_dir: dir.path().to_path_buf(),
            backup_path: dir.path().join(BACKUP_FILENAME),
        };

        let (tx, errors) = mpsc::unbounded_channel();
        let sink: ErrorSink = Arc::new(move |e: &Error| {
            let _ = tx.send(e.to_string());
        });

        let link = Arc::new(link);
        let runtime = ChildRuntime::with_link(paths.clone(), grace, sink, link.clone()).unwrap();

        Fixture {
            _dir: dir,
            paths,
            link,
            errors,
            runtime,
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_update_runs_hooks_in_order_then_requests_restart() {
        let f = fixture(FakeLink::default(), Duration::from_secs(15));
        let order = Arc::new(Mutex::new(Vec::new()));

        let hooks = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                ShutdownHook::new(format!("hook-{}", i), move || async move {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
            })
            .collect();

        f.runtime.update(b"v2", hooks).unwrap();
        assert_eq!(std::fs::read(&f.paths.executable).unwrap(), b"v2");
        assert_eq!(std::fs::read(&f.paths.backup_path).unwrap(), b"v1");

        let link = Arc::clone(&f.link);
        eventually(move || link.restarts.load(Ordering::SeqCst) == 1).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failing_hook_suppresses_restart_request() {
        let mut f = fixture(FakeLink::default(), Duration::from_secs(15));
        let ran_after = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran_after);

        let hooks = vec![
            ShutdownHook::blocking("drain", || Ok(())),
            ShutdownHook::new("flush", || async { Err(anyhow::anyhow!("disk full")) }),
            ShutdownHook::new("never", move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ];

        // Staging succeeded, so the caller still sees success.
        f.runtime.update(b"v2", hooks).unwrap();

        let reported = f.errors.recv().await.unwrap();
        assert!(reported.contains("#1"));
        assert!(reported.contains("flush"));
        assert!(reported.contains("disk full"));

        assert_eq!(f.link.restarts.load(Ordering::SeqCst), 0);
        assert!(!ran_after.load(Ordering::SeqCst));
        assert!(f.link.exits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_after_failed_handoff_is_allowed() {
        let mut f = fixture(FakeLink::default(), Duration::from_secs(15));

        let failing = vec![ShutdownHook::new("fail", || async { Err(anyhow::anyhow!("no")) })];
        f.runtime.update(b"v2", failing).unwrap();
        f.errors.recv().await.unwrap();

        f.runtime.update(b"v3", Vec::new()).unwrap();
        let link = Arc::clone(&f.link);
        eventually(move || link.restarts.load(Ordering::SeqCst) == 1).await;
        assert_eq!(std::fs::read(&f.paths.executable).unwrap(), b"v3");
    }

    #[tokio::test]
    async fn test_concurrent_update_rejected() {
        let f = fixture(FakeLink::default(), Duration::from_secs(15));
        let gate = Arc::new(Notify::new());
        let wait = Arc::clone(&gate);

        let hooks = vec![ShutdownHook::new("slow", move || async move {
            wait.notified().await;
            Ok(())
        })];
        f.runtime.update(b"v2", hooks).unwrap();

        assert!(matches!(
            f.runtime.update(b"v3", Vec::new()),
            Err(Error::UpdateInFlight)
        ));
        assert_eq!(std::fs::read(&f.paths.executable).unwrap(), b"v2");
        gate.notify_one();
    }

    #[tokio::test]
    async fn test_swap_failure_is_returned_synchronously() {
        let f = fixture(FakeLink::default(), Duration::from_secs(15));
        std::fs::remove_file(&f.paths.executable).unwrap();

        assert!(matches!(
            f.runtime.update(b"v2", Vec::new()),
            Err(Error::Swap { .. })
        ));

        // The failed attempt does not block a later one.
        std::fs::write(&f.paths.executable, b"v1").unwrap();
        assert!(f.runtime.update(b"v2", Vec::new()).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_supervisor_reported() {
        let link = FakeLink {
            fail_restart: true,
            ..FakeLink::default()
        };
        let mut f = fixture(link, Duration::from_secs(15));

        f.runtime.update(b"v2", Vec::new()).unwrap();
        let reported = f.errors.recv().await.unwrap();
        assert!(reported.contains("supervisor gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retiring_child_forced_after_grace() {
        let grace = Duration::from_secs(15);
        let f = fixture(FakeLink::default(), grace);
        let mut retirement = f.runtime.retirement();

        f.runtime.update(b"v2", Vec::new()).unwrap();
        let link = Arc::clone(&f.link);
        eventually(move || link.restarts.load(Ordering::SeqCst) == 1).await;

        let started = Instant::now();
        f.link.terminate.notify_one();
        retirement.wait().await;
        assert!(retirement.is_retiring());

        let link = Arc::clone(&f.link);
        eventually(move || link.forced.load(Ordering::SeqCst) == 1).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= grace, "forced after {:?}", elapsed);
        assert!(elapsed < grace + Duration::from_millis(50), "forced after {:?}", elapsed);
        assert!(f.link.exits.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retirement_outlives_dropped_runtime() {
        let f = fixture(FakeLink::default(), Duration::from_secs(15));
        let mut retirement = f.runtime.retirement();
        drop(f);

        let waited = tokio::time::timeout(Duration::from_secs(60), retirement.wait()).await;
        assert!(waited.is_err(), "retired without graceful-terminate");
        assert!(!retirement.is_retiring());
    }

    #[tokio::test]
    async fn test_retiring_child_without_listener_exits() {
        let f = fixture(FakeLink::default(), Duration::from_secs(15));

        f.runtime.update(b"v2", Vec::new()).unwrap();
        let link = Arc::clone(&f.link);
        eventually(move || link.restarts.load(Ordering::SeqCst) == 1).await;

        f.link.terminate.notify_one();
        let link = Arc::clone(&f.link);
        eventually(move || !link.exits.lock().unwrap().is_empty()).await;

        assert_eq!(*f.link.exits.lock().unwrap(), vec![0]);
        assert_eq!(f.link.forced.load(Ordering::SeqCst), 0);
    }
}
