use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use stagehand_events::{SearchQuery, SubscriberKind, subscriber_fn};
use stagehand_kernel::{KernelBuilder, KernelConfig};
use stagehand_protocol::{Action, SessionId};
use stagehand_runtime::StepOutcome;
use stagehand_sandbox::{BackendKind, TeardownMode};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Direct,
    Local,
    Cluster,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Direct => BackendKind::Direct,
            Backend::Local => BackendKind::Local,
            Backend::Cluster => BackendKind::Cluster,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "stagehandd")]
#[command(about = "Stagehand demo daemon")]
struct Cli {
    /// TOML configuration; defaults apply when the file does not exist.
    #[arg(long, default_value = "stagehand.toml")]
    config: PathBuf,
    #[arg(long, value_enum)]
    backend: Option<Backend>,
    /// Reattach to an existing session instead of starting a new one.
    #[arg(long)]
    session: Option<String>,
    /// Commands to run, in order.
    #[arg(long = "run", default_values_t = vec!["echo hello from stagehand".to_owned(), "ls -la".to_owned()])]
    commands: Vec<String>,
    /// Delete the session's storage on close (cluster volumes included).
    #[arg(long)]
    archive: bool,
    /// Print the default configuration and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    if cli.print_config {
        println!("{}", KernelConfig::default_toml());
        return Ok(());
    }

    let mut config = KernelConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(backend) = cli.backend {
        config.sandbox.backend = backend.into();
    }
    let pool_size = config.sandbox.local.pool_size;

    let kernel = KernelBuilder::new(config).build()?;
    if pool_size > 0 {
        let started = kernel.prewarm(pool_size).await;
        info!(started, "warm pool filled");
    }

    let session = kernel
        .open_session(cli.session.map(SessionId::from_string))
        .await?;
    info!(session_id = %session, backend = ?kernel.backend_kind(), "session opened");

    kernel.subscribe(
        &session,
        SubscriberKind::Ui,
        subscriber_fn(|event| async move {
            match serde_json::to_string(&*event) {
                Ok(rendered) => info!(event = %rendered, "event.appended"),
                Err(error) => warn!(event_id = %event.id, %error, "event not renderable"),
            }
            Ok(())
        }),
    )?;

    for command in cli.commands {
        let outcome = kernel.submit(&session, Action::cmd(command.clone())).await?;
        match outcome {
            StepOutcome::Observed { observation, .. } => {
                info!(%command, kind = ?observation.kind, "action observed");
                println!("{}", observation.content);
            }
            StepOutcome::AwaitingConfirmation { action_id } => {
                warn!(%command, %action_id, "action needs confirmation, rejecting it");
                kernel.resolve_confirmation(&session, action_id, false).await?;
            }
            StepOutcome::LimitReached { error, stopped } => {
                warn!(%error, stopped, "limit reached");
                if stopped {
                    break;
                }
            }
            StepOutcome::Disconnected => {
                warn!("sandbox lost, restarting");
                kernel.restart_sandbox(&session).await?;
            }
            other => info!(%command, outcome = ?other, "action handled"),
        }
    }

    let events = kernel.search(&session, SearchQuery::all()).await?;
    info!(events = events.len(), state = kernel.sandbox_state(&session).status_code(), "closing session");

    let mode = if cli.archive {
        TeardownMode::Archive
    } else {
        TeardownMode::Release
    };
    let failures = kernel.shutdown(mode).await;
    for failure in &failures {
        warn!(step = %failure.step, error = %failure.message, "cleanup step failed");
    }

    Ok(())
}
