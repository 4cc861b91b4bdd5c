// ABOUTME: `hivemind serve`: runs the brain hub with the headless supervisor attached.
// ABOUTME: Stops on Ctrl+C or SIGTERM, removing the socket file on the way out.

use anyhow::{Context, Result};
use hivemind_brain::{run_supervisor, BrainConfig, HeadlessExecutor, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Settings for `hivemind serve` gathered from the command line.
pub struct ServeOptions {
    pub config_path: Option<PathBuf>,
    pub socket: Option<PathBuf>,
    pub program: String,
    pub max_instances: usize,
}

pub async fn run(options: ServeOptions) -> Result<()> {
    let config_path = options.config_path.unwrap_or_else(BrainConfig::default_path);
    let mut config = BrainConfig::load_or_default(&config_path)?;
    if let Some(socket) = options.socket {
        config.socket_path = socket.to_string_lossy().into_owned();
    }

    let mut server = Server::from_config(&config);
    let actions = server
        .take_actions()
        .context("action queue already claimed")?;
    server.start().await?;

    let repo_path = std::env::current_dir()
        .context("resolving working directory")?
        .display()
        .to_string();
    let executor = Arc::new(
        HeadlessExecutor::new(server.events(), repo_path)
            .with_manager(server.manager())
            .with_program(options.program)
            .with_limit(options.max_instances),
    );
    let supervisor = tokio::spawn(run_supervisor(actions, executor.clone(), server.closed()));

    println!("Brain listening on {}", server.socket_path().display());
    println!("Press Ctrl+C to stop.");

    shutdown_signal().await;
    server.stop().await;
    if let Err(e) = supervisor.await {
        warn!(error = %e, "Supervisor task failed");
    }

    info!(
        instances = executor.instance_count().await,
        "Server shut down gracefully"
    );
    println!("\nServer stopped.");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
