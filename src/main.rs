use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, EnvFilter};

use wristband::agent::Agent;
use wristband::config::Config;
use wristband::migrate::Migrator;
use wristband::repository::ClickHouseRepository;

/// Tiered sampling agent: polls targets on schedules, caches current state
/// and rolls history up into coarser archive tiers.
#[derive(Parser)]
#[command(name = "wristband", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Manage the agent-state schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum MigrateAction {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Print the current version and dirty flag.
    Status,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("wristband {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Migrate { action }) => rt.block_on(migrate(cfg, action)),
        _ => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting wristband",
            );
            rt.block_on(run(cfg, &config_path))
        }
    }
}

async fn migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let repo = ClickHouseRepository::connect(cfg.repository)
        .await
        .context("connecting to repository")?;
    let migrator = Migrator::new(&repo);

    match action {
        MigrateAction::Up => migrator.up().await,
        MigrateAction::Down => migrator.down().await,
        MigrateAction::Status => {
            let (version, dirty) = migrator.status().await?;
            println!("version: {version}, dirty: {dirty}");
            Ok(())
        }
    }
}

async fn run(cfg: Config, config_path: &Path) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;

    let mut agent = Agent::from_config(cfg)?;
    agent.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                tracing::info!(
                    path = %config_path.display(),
                    "received SIGHUP, reloading configuration"
                );
                if let Err(e) = Config::load(config_path).and_then(|cfg| agent.reload(cfg)) {
                    tracing::error!(error = %e, "configuration reload failed");
                }
            }
        }
    }

    agent.stop().await?;

    tracing::info!("wristband stopped");

    Ok(())
}
