//! PrintToPeer gateway daemon.
//!
//! This binary runs as a background daemon, bridging locally attached
//! 3D printers to the PrintToPeer service over a websocket.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! pgwd start
//!
//! # Start the daemon (background/daemonized)
//! pgwd start -d
//!
//! # Start with an explicit config file
//! pgwd start --config /etc/pgw/config.toml
//!
//! # Stop the daemon
//! pgwd stop
//!
//! # Check daemon status
//! pgwd status
//! ```

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pgwd::config::GatewayConfig;
use pgwd::jobs::JobRunner;
use pgwd::media::spawn_media;
use pgwd::registry::spawn_registry;
use pgwd::remote::{spawn_remote, RemoteHandle};
use pgwd::router::Router;
use pgwd::system::SystemControl;

const DEFAULT_CONFIG_PATH: &str = "/etc/pgw/config.toml";

/// PrintToPeer gateway daemon
#[derive(Parser, Debug)]
#[command(name = "pgwd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Path to the gateway configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

/// Runtime state files live under the user state directory, falling
/// back to /tmp on systems without one (the stock gateway image runs
/// as a dedicated user with XDG_STATE_HOME set).
struct StateFiles {
    dir: PathBuf,
}

impl StateFiles {
    fn locate() -> Self {
        let dir = dirs::state_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("pgw");
        Self { dir }
    }

    fn pid_file(&self) -> PathBuf {
        self.dir.join("pgwd.pid")
    }

    fn log_file(&self) -> PathBuf {
        self.dir.join("pgwd.log")
    }

    /// Pid of a live daemon, if one is running. A pid file pointing at
    /// a dead process is stale and gets cleaned up here.
    fn running_pid(&self) -> Option<u32> {
        let pid: u32 = fs::read_to_string(self.pid_file())
            .ok()?
            .trim()
            .parse()
            .ok()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            self.clear_pid();
            None
        }
    }

    fn record_pid(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).context("Failed to create state directory")?;
        fs::write(self.pid_file(), process::id().to_string()).context("Failed to write PID file")
    }

    fn clear_pid(&self) {
        let _ = fs::remove_file(self.pid_file());
    }
}

fn process_alive(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn signal_stop(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid as i32, libc::SIGTERM) } != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
        Ok(())
    }
    #[cfg(not(unix))]
    bail!("Stop command is only supported on Unix systems")
}

fn main() -> Result<()> {
    let args = Args::parse();
    let state = StateFiles::locate();

    // Bare `pgwd` starts in the foreground with the default config.
    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: PathBuf::from(DEFAULT_CONFIG_PATH),
    });

    match command {
        Command::Start { daemon, config } => start(&state, daemon, config),
        Command::Stop => stop(&state),
        Command::Status => status(&state),
    }
}

fn start(state: &StateFiles, daemon: bool, config: PathBuf) -> Result<()> {
    if let Some(pid) = state.running_pid() {
        eprintln!("Daemon is already running (PID {pid})");
        eprintln!("Use 'pgwd stop' to stop it first.");
        process::exit(1);
    }

    if daemon {
        daemonize(state)?;
    }

    state.record_pid()?;
    let result = run_daemon(config);
    state.clear_pid();
    result
}

fn stop(state: &StateFiles) -> Result<()> {
    let Some(pid) = state.running_pid() else {
        println!("Daemon is not running.");
        return Ok(());
    };

    println!("Stopping daemon (PID {pid})...");
    signal_stop(pid)?;

    // Shutdown is normally immediate; give it five seconds before
    // reporting failure.
    for _ in 0..50 {
        if !process_alive(pid) {
            println!("Daemon stopped.");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    eprintln!("Daemon did not stop within 5 seconds.");
    process::exit(1);
}

fn status(state: &StateFiles) -> Result<()> {
    match state.running_pid() {
        Some(pid) => {
            println!("Daemon is running (PID {pid})");
            let log = state.log_file();
            if log.exists() {
                println!("Log: {}", log.display());
            }
            Ok(())
        }
        None => {
            println!("Daemon is not running.");
            process::exit(1);
        }
    }
}

fn daemonize(state: &StateFiles) -> Result<()> {
    use daemonize::Daemonize;

    fs::create_dir_all(&state.dir).context("Failed to create state directory")?;
    let log = fs::File::create(state.log_file()).context("Failed to create log file")?;
    let log_err = log.try_clone().context("Failed to clone log handle")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(log)
        .stderr(log_err)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config_path: PathBuf) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pgwd=info".parse()?)
                .add_directive("pgw_core=info".parse()?)
                .add_directive("pgw_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Gateway daemon starting"
    );

    let config = Arc::new(
        GatewayConfig::load(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?,
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let (remote_handle, outbound_rx) = RemoteHandle::new_pair();

    let registry = spawn_registry(config.clone(), remote_handle.clone(), cancel_token.clone());
    info!("Device registry started");

    let media = spawn_media(config.clone(), remote_handle, cancel_token.clone());

    let system = SystemControl::new(config.system.clone());
    let jobs = Arc::new(JobRunner::new(config.clone(), registry.clone()));
    let router = Router::new(registry.clone(), jobs, media, system);

    info!(endpoint = %config.remote.endpoint_url(), "Starting remote session");
    let session = spawn_remote(config, registry, router, outbound_rx, cancel_token.clone());

    // The session runs for the life of the daemon; it only returns on
    // shutdown or a credential rejection that forbids retrying.
    if let Err(e) = session.await {
        error!(error = %e, "Remote session task failed");
    }
    cancel_token.cancel();

    info!("Gateway daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());
        match (sigterm, sigint) {
            (Ok(mut term), Ok(mut int)) => {
                tokio::select! {
                    _ = term.recv() => info!("Received SIGTERM"),
                    _ = int.recv() => info!("Received SIGINT"),
                }
            }
            _ => {
                error!("Failed to install signal handlers; running until killed");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
        }
    }
}
