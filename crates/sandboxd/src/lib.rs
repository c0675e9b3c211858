//! sandboxd - workspace command execution daemon
//!
//! Library components for the daemon process: the workspace manager,
//! process runner, execution registry and result reporter, plus the HTTP
//! front end that exposes them.

pub mod registry;
pub mod reporter;
pub mod runner;
pub mod server;
pub mod workspace;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use registry::{Registry, RegistryConfig};
use reporter::Reporter;
use runner::{ProcessRunner, RunnerConfig};
use sandbox_core::Config;
use server::AppState;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use workspace::{Workspace, WorkspaceError};

/// Environment variable holding the API token.
pub const TOKEN_ENV: &str = "SANDBOX_TOKEN";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Engine settings.
    pub engine: Config,
    /// Address the HTTP server binds to.
    pub host: IpAddr,
    pub port: u16,
    /// Auth token for the HTTP API. Auth is off when unset.
    pub auth_token: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            engine: Config::default(),
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            auth_token: std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()),
        }
    }
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    registry: Arc<Registry>,
    reporter: Reporter,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create the workspace and the execution engine.
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let workspace = Arc::new(Workspace::from_config(&config.engine)?);
        let runner = ProcessRunner::new(RunnerConfig::from_config(&config.engine));
        let registry = Arc::new(Registry::new(
            workspace,
            runner,
            RegistryConfig::from_config(&config.engine),
        ));
        let reporter = Reporter::from_config(&config.engine);

        Ok(Self {
            config,
            registry,
            reporter,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Serve HTTP until `shutdown` is called, then stop every execution.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let engine = &self.config.engine;
        info!("sandboxd starting on {}:{}", self.config.host, self.config.port);
        info!("workspace: {}", self.registry.workspace().root().display());
        info!(
            "max concurrent executions: {} ({} mode)",
            engine.max_concurrent,
            engine.backpressure.as_str()
        );
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let state = Arc::new(AppState {
            registry: Arc::clone(&self.registry),
            reporter: self.reporter.clone(),
            auth_token: self.config.auth_token.clone(),
        });
        let addr = SocketAddr::new(self.config.host, self.config.port);
        let served = server::start_server(state, addr, self.shutdown.clone()).await;

        self.registry.shutdown().await;
        info!("all executions stopped");
        served.map_err(DaemonError::from)
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}
