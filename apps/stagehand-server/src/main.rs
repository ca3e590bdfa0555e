use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use stagehand_sandbox::{ExecutorLimits, WorkspaceRoot};
use stagehand_server::{ServerState, router, shutdown_signal};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "stagehand-server")]
#[command(about = "Runs agent actions inside a sandbox workspace")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
    #[arg(long, default_value_t = 60_000)]
    port: u16,
    #[arg(long, default_value = "/workspace")]
    workspace: PathBuf,
    /// Captured bytes per output stream of a command.
    #[arg(long, default_value_t = 512 * 1024)]
    max_output_bytes: usize,
    #[arg(long, default_value_t = 2_000)]
    kill_grace_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let workspace = WorkspaceRoot::prepare(&cli.workspace)
        .with_context(|| format!("cannot use workspace {}", cli.workspace.display()))?;
    let limits = ExecutorLimits {
        max_output_bytes: cli.max_output_bytes,
        kill_grace_ms: cli.kill_grace_ms,
        ..ExecutorLimits::default()
    };
    let state = ServerState::direct(workspace, limits)?;

    let listen = SocketAddr::new(cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(listen = %listen, workspace = %cli.workspace.display(), "stagehand-server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
