//! Demo host for the handoff protocol.
//!
//! `handoff run` starts a supervised service that watches a drop file. When a
//! new binary is copied there, the child verifies it, swaps itself out and
//! hands off to the new version.

use buckos_handoff::{checksum, Handoff, HandoffConfig, ShutdownHook};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the child looks for a new binary.
const WATCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(
    name = "handoff",
    about = "Buckos handoff - replace a running binary without dropping the process",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a supervised demo service
    Run {
        /// Handoff configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Grace period in seconds, overrides the configuration
        #[arg(long)]
        grace: Option<u64>,

        /// Drop file polled for a replacement binary
        #[arg(short, long)]
        watch: Option<PathBuf>,

        /// Expected SHA-256 of the replacement binary
        #[arg(long)]
        checksum: Option<String>,

        /// Write the child's PID to this file on startup
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Exit the child on its own after this many seconds
        #[arg(long)]
        exit_after: Option<u64>,

        /// Exit code used with --exit-after
        #[arg(long, default_value_t = 0)]
        exit_code: i32,
    },

    /// Print the SHA-256 of a file
    Checksum {
        /// File to hash
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            grace,
            watch,
            checksum,
            pid_file,
            exit_after,
            exit_code,
        } => {
            let config = match config {
                Some(path) => HandoffConfig::from_file(&path)?,
                None => HandoffConfig::default(),
            };

            let mut builder = Handoff::builder().config(config);
            if let Some(secs) = grace {
                builder = builder.shutdown_grace_time(Duration::from_secs(secs));
            }

            let handoff = builder.start().await?;
            if !handoff.is_child() {
                return Ok(());
            }

            run_child(&handoff, watch, checksum, pid_file, exit_after, exit_code).await?;
        }

        Commands::Checksum { file } => {
            let bytes = std::fs::read(&file)?;
            println!("{}  {}", checksum::sha256_hex(&bytes), file.display());
        }
    }

    Ok(())
}

/// Body of the supervised service.
async fn run_child(
    handoff: &Handoff,
    watch: Option<PathBuf>,
    expected: Option<String>,
    pid_file: Option<PathBuf>,
    exit_after: Option<u64>,
    exit_code: i32,
) -> anyhow::Result<()> {
    let pid = std::process::id();
    info!(pid = pid, "Child serving");

    if let Some(path) = pid_file {
        std::fs::write(&path, pid.to_string())?;
    }

    let mut retirement = handoff.retirement()?;
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    let deadline = async {
        match exit_after {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = retirement.wait() => {
                info!(pid = pid, "Retired by supervisor, exiting");
                return Ok(());
            }
            _ = &mut deadline => {
                warn!(pid = pid, code = exit_code, "Exiting on request");
                std::process::exit(exit_code);
            }
            _ = ticker.tick() => {
                if let Some(path) = watch.as_deref() {
                    if let Err(e) = poll_drop_file(handoff, path, expected.as_deref()) {
                        error!(error = %e, "Update failed");
                    }
                }
            }
        }
    }
}

/// Apply a binary found at `path`, if any.
fn poll_drop_file(handoff: &Handoff, path: &Path, expected: Option<&str>) -> anyhow::Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let bytes = std::fs::read(path)?;
    std::fs::remove_file(path)?;

    if let Some(expected) = expected {
        checksum::verify(&bytes, expected)?;
    }

    info!(bytes = bytes.len(), "Applying new binary");
    let pid = std::process::id();
    handoff.update(
        &bytes,
        vec![ShutdownHook::new("drain", move || async move {
            info!(pid = pid, "Draining before handoff");
            Ok(())
        })],
    )?;
    Ok(())
}
