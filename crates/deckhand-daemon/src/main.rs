//! Deckhand daemon: runs the agent supervisor behind the HTTP/WebSocket API.
//!
//! On SIGINT or SIGTERM it stops every agent, tells WebSocket clients the
//! server is going away and drains the HTTP server, giving up after
//! [`SHUTDOWN_TIMEOUT`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::oneshot;

use deckhand_core::config::{DEFAULT_CLI_PATH, DEFAULT_MAX_CONCURRENT};
use deckhand_core::{AgentSupervisor, EventBus, NotificationSink, SupervisorConfig};
use deckhand_http::AppState;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "deckhand-daemon", version, about = "Supervise coding-assistant CLI agents over HTTP")]
struct Args {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 3001)]
    port: u16,

    /// Ceiling on agents that are running or waiting for approval
    #[arg(long, env = "MAX_CONCURRENT_AGENTS", default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// CLI executable; bare names are looked up through the login shell
    #[arg(long, env = "CLAUDE_CLI_PATH", default_value = DEFAULT_CLI_PATH)]
    cli_path: String,

    /// Extra directory passed to every run as --add-dir (repeatable)
    #[arg(long = "add-dir")]
    add_dirs: Vec<PathBuf>,

    /// Working directory for agent processes
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Never try a pseudo-terminal; launch with plain pipes
    #[arg(long)]
    no_pty: bool,

    /// Mirror every agent's output to <dir>/<agent-id>.log
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Serve the browser UI from this directory
    #[arg(long)]
    static_dir: Option<PathBuf>,
}

impl Args {
    fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig::new()
            .max_concurrent(self.max_concurrent)
            .cli_path(self.cli_path.clone());
        for dir in &self.add_dirs {
            config = config.add_dir(dir.clone());
        }
        if let Some(ref dir) = self.working_dir {
            config = config.working_dir(dir.clone());
        }
        if self.no_pty {
            config = config.no_pty();
        }
        if let Some(ref dir) = self.log_dir {
            config = config.log_dir(dir.clone());
        }
        config
    }
}

/// Resolves on the first SIGINT (or SIGTERM on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("SIGINT received, shutting down gracefully..."),
        _ = terminate => log::info!("SIGTERM received, shutting down gracefully..."),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let addr = args.addr()?;
    let config = args.supervisor_config();
    log::info!(
        "Max concurrent agents: {}, CLI: {}, PTY: {}",
        config.max_concurrent,
        config.cli_path,
        config.use_pty
    );

    let event_bus = Arc::new(EventBus::new());
    let supervisor = AgentSupervisor::with_system_launcher(
        config,
        event_bus.clone() as Arc<dyn NotificationSink>,
    );
    let state = Arc::new(AppState::new(supervisor.clone(), event_bus.clone()));

    let (close_tx, close_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(deckhand_http::serve(
        state,
        addr,
        args.static_dir.clone(),
        async {
            close_rx.await.ok();
        },
    ));

    tokio::select! {
        result = &mut server => {
            // Only reachable if the server failed (e.g. the port is taken).
            result??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    let graceful = async {
        supervisor.shutdown().await;
        log::info!("All agents stopped");

        event_bus.server_shutdown();
        let _ = close_tx.send(());
        match server.await {
            Ok(Ok(())) => log::info!("HTTP server closed"),
            Ok(Err(e)) => log::error!("Error closing HTTP server: {}", e),
            Err(e) => log::error!("HTTP server task failed: {}", e),
        }
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, graceful).await.is_err() {
        log::error!("Graceful shutdown timeout exceeded, forcing exit");
        std::process::exit(1);
    }

    log::info!("Graceful shutdown complete");
    Ok(())
}
