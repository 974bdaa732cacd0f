//! Relay Daemon - chat and file relay server
//!
//! This binary accepts client connections on a TCP port, relays chat lines
//! between sessions and serves a shared directory for uploads and downloads.
//!
//! # Usage
//!
//! ```bash
//! # Start the server (foreground)
//! relayd start --port 9000 --root /srv/relay
//!
//! # Start the server (background/daemonized)
//! relayd start -d --config /etc/relay.toml
//!
//! # Stop the server
//! relayd stop
//!
//! # Check server status
//! relayd status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relayd::config::{ConfigError, PartialConfig, ServerConfig};
use relayd::registry::spawn_registry;
use relayd::server::RelayServer;

/// Exit status for unusable startup configuration
const USAGE_EXIT_CODE: i32 = 2;

/// Relay daemon - multi-client chat and file relay
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        #[command(flatten)]
        settings: StartSettings,
    },
    /// Stop the running server
    Stop,
    /// Show server status
    Status,
}

/// Settings given on the command line. They override the environment and
/// the config file.
#[derive(clap::Args, Debug)]
struct StartSettings {
    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory served to clients
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    bind: Option<IpAddr>,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds a session may stay silent before it is closed (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,
}

impl StartSettings {
    fn into_partial(self) -> (PartialConfig, Option<PathBuf>) {
        let partial = PartialConfig {
            bind: self.bind,
            port: self.port,
            root: self.root,
            max_sessions: self.max_sessions,
            idle_timeout_secs: self.idle_timeout,
            shutdown_grace_secs: None,
        };
        (partial, self.config)
    }
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("relay")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("relayd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("relayd.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

/// Layers CLI settings over the environment over the config file.
fn load_config(settings: StartSettings) -> Result<ServerConfig, ConfigError> {
    let (cli, config_path) = settings.into_partial();

    let file = match config_path {
        Some(path) => PartialConfig::load(&path)?,
        None => PartialConfig::default(),
    };

    let mut config = cli.merge(PartialConfig::from_env()?).merge(file).resolve()?;

    // Daemonizing moves the working directory to /
    config.root = config
        .root
        .canonicalize()
        .map_err(|_| ConfigError::RootNotDirectory(config.root.clone()))?;
    Ok(config)
}

fn usage_error(error: &ConfigError) -> ! {
    eprintln!("error: {error}");
    eprintln!();
    eprintln!("Usage: relayd start --port <PORT> --root <DIR> [--config <FILE>]");
    eprintln!("       (or set RELAY_PORT and RELAY_ROOT)");
    process::exit(USAGE_EXIT_CODE);
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Start { daemon, settings } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Server is already running (PID {pid})");
                eprintln!("Use 'relayd stop' to stop it first.");
                process::exit(1);
            }

            let config = match load_config(settings) {
                Ok(config) => config,
                Err(e) => usage_error(&e),
            };

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping server (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Server stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Server did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Server is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Server is running (PID {pid})");
                let log_path = log_file_path();
                if log_path.exists() {
                    println!("Log: {}", log_path.display());
                }
                Ok(())
            } else {
                println!("Server is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: ServerConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("relayd=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Relay server starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = spawn_registry(config.max_sessions);
    info!(max_sessions = config.max_sessions, "Session registry started");

    let server = RelayServer::bind(&config, registry, cancel_token)
        .await
        .context("Failed to start server")?;

    info!(
        addr = %server.local_addr(),
        root = %config.root.display(),
        "Listening"
    );

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Relay server stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
