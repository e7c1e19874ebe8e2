//! wardend — reliability supervisor for a long-running AI-agent gateway.
//!
//! Watches gateway liveness, HTTP health, network reachability, and config
//! integrity; restarts, rolls back, or holds as the signals dictate.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wardend::config::{default_config_file, SupervisorConfig};
use wardend::supervisor::Supervisor;
use warden_persist::{PersistError, PidFile};
use warden_probes::{GatewayProbes, SystemProbes};
use warden_safeguard::{ConfigSafeguard, SafeguardError, SnapshotReason};

#[derive(Parser)]
#[command(name = "wardend")]
#[command(about = "Reliability supervisor for the AI-agent gateway")]
#[command(version)]
struct Cli {
    /// Path to the supervisor config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor loop in the foreground
    Start,

    /// Signal a running supervisor to shut down
    Stop,

    /// Show supervisor, gateway, safeguard, and backup status
    Status,

    /// Accept the in-flight config change and disarm the rollback window
    Confirm,

    /// Restore the gateway config from a snapshot and restart the gateway
    Rollback {
        /// Snapshot path (defaults to the armed ticket's, else the newest)
        snapshot: Option<PathBuf>,
    },

    /// Take a manual snapshot of the gateway config
    Snapshot,

    /// Print the supervisor version
    Version,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // The dispatcher wrapping this binary expects exit 1 for unknown
    // commands; clap defaults to 2.
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(if e.use_stderr() { 1 } else { 0 });
    });

    let config_file = cli.config.clone().unwrap_or_else(default_config_file);
    let cfg = SupervisorConfig::load(&config_file);

    match cli.command {
        Commands::Start => start(cfg).await,
        Commands::Stop => stop(&cfg),
        Commands::Status => {
            init_stderr_logging();
            wardend::status::print_status(&cfg).await;
            Ok(())
        }
        Commands::Confirm => {
            init_stderr_logging();
            confirm(&cfg)
        }
        Commands::Rollback { snapshot } => {
            init_stderr_logging();
            rollback(&cfg, snapshot.as_deref())
        }
        Commands::Snapshot => {
            init_stderr_logging();
            snapshot(&cfg)
        }
        Commands::Version => {
            println!("wardend {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

// ─── Logging ──────────────────────────────────────────────────────────────────

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_stderr_logging() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter())
        .init();
}

fn init_file_logging(path: &std::path::Path) -> anyhow::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        .with(env_filter())
        .init();
    Ok(())
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn start(cfg: SupervisorConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cfg.state_dir)?;
    init_file_logging(&cfg.log_file())?;

    let pid_file = PidFile::new(cfg.pid_file());
    match pid_file.acquire() {
        Ok(()) => {}
        Err(PersistError::AlreadyRunning(pid)) => {
            eprintln!("supervisor already running (pid {pid})");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    }

    Supervisor::new(cfg, SystemProbes::new()).run(pid_file).await
}

fn stop(cfg: &SupervisorConfig) -> anyhow::Result<()> {
    let pid_file = PidFile::new(cfg.pid_file());
    match pid_file.live_pid() {
        Some(pid) => {
            Command::new("kill").arg(pid.to_string()).status()?;
            println!("stop signal sent to supervisor (pid {pid})");
        }
        None => println!("supervisor not running"),
    }
    Ok(())
}

fn safeguard_for(cfg: &SupervisorConfig) -> ConfigSafeguard {
    ConfigSafeguard::new(
        cfg.config_path.clone(),
        &cfg.state_dir,
        cfg.rollback_timeout,
        cfg.snapshot_retention,
    )
}

fn confirm(cfg: &SupervisorConfig) -> anyhow::Result<()> {
    let mut safeguard = safeguard_for(cfg);
    if safeguard.confirm()? {
        println!("config change confirmed, rollback window disarmed");
    } else {
        println!("nothing armed");
    }
    Ok(())
}

fn rollback(cfg: &SupervisorConfig, snapshot: Option<&std::path::Path>) -> anyhow::Result<()> {
    let mut safeguard = safeguard_for(cfg);
    match safeguard.rollback(snapshot) {
        Ok(used) => {
            println!("config rolled back to {}", used.display());
            info!(reason = "config-rollback", "restarting gateway");
            let probes = SystemProbes::new();
            if let Err(e) = probes.service_restart(&cfg.service_label) {
                eprintln!("warning: gateway restart failed: {e}");
            }
            Ok(())
        }
        Err(SafeguardError::NoSnapshot) => {
            eprintln!("no snapshot available");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn snapshot(cfg: &SupervisorConfig) -> anyhow::Result<()> {
    let safeguard = safeguard_for(cfg);
    match safeguard.snapshot(SnapshotReason::Manual) {
        Ok(path) => {
            println!("snapshot written: {}", path.display());
            Ok(())
        }
        Err(e) => {
            eprintln!("snapshot failed: {e}");
            std::process::exit(1);
        }
    }
}
