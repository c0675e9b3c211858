//! sandboxd - workspace command execution daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use sandbox_core::{Backpressure, Config};
use sandboxd::{Daemon, DaemonConfig, DEFAULT_PORT, TOKEN_ENV};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "sandboxd", about = "Workspace command execution daemon", version)]
struct Cli {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Config file (key=value)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace root (overrides WORKSPACE_DIR and the config file)
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Maximum concurrently running executions
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Refuse requests instead of queueing them when all slots are busy
    #[arg(long)]
    reject_when_busy: bool,

    /// API token; auth is disabled when unset
    #[arg(long, env = TOKEN_ENV, hide_env_values = true)]
    token: Option<String>,
}

/// Defaults, then the config file, then the environment, then flags.
fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let mut config = Config::default();
    if let Some(path) = cli.config.clone().or_else(Config::default_path) {
        config
            .load_file(&path)
            .wrap_err_with(|| format!("failed to load config from {}", path.display()))?;
        info!("loaded config from {}", path.display());
    }
    config.apply_env();

    if let Some(workspace) = &cli.workspace {
        config.workspace_root.clone_from(workspace);
    }
    if let Some(max) = cli.max_concurrent {
        config.max_concurrent = max;
    }
    if cli.reject_when_busy {
        config.backpressure = Backpressure::Reject;
    }
    config.check().wrap_err("invalid configuration")?;
    Ok(config)
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig {
        engine: load_config(&cli)?,
        host: cli.host,
        port: cli.port,
        auth_token: cli.token.filter(|t| !t.is_empty()),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config).wrap_err("failed to initialize daemon")?;
        let run = daemon.run();
        tokio::pin!(run);

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
            let mut sigint =
                signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

            tokio::select! {
                result = &mut run => return finish(result),
                _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
                _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = &mut run => return finish(result),
                _ = tokio::signal::ctrl_c() => info!("received SIGINT, initiating graceful shutdown"),
            }
        }

        daemon.shutdown();
        finish(run.await)
    })
}

fn finish(result: Result<(), sandboxd::DaemonError>) -> eyre::Result<()> {
    if let Err(e) = &result {
        error!("daemon error: {}", e);
    }
    result.wrap_err("daemon stopped with an error")
}
