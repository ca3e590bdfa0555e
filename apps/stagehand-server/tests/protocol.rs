use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use stagehand_exec::{ActionExecutor, CancellationToken, ExecuteRequest, HttpActionClient};
use stagehand_protocol::{Action, ExecutionError, ExecutionResult, Observation, ObservationKind};
use stagehand_sandbox::{ExecutorLimits, WorkspaceRoot};
use stagehand_server::{ServerState, router};

fn unique_test_root(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("stagehand-server-{name}-{nanos}"))
}

async fn serve(state: ServerState) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    Ok(addr)
}

async fn direct_server(name: &str) -> Result<(HttpActionClient, PathBuf)> {
    let root = unique_test_root(name);
    let state = ServerState::direct(WorkspaceRoot::prepare(&root)?, ExecutorLimits::default())?;
    let addr = serve(state).await?;
    Ok((HttpActionClient::new(format!("http://{addr}"))?, root))
}

#[tokio::test]
async fn alive_and_server_info() -> Result<()> {
    let (client, root) = direct_server("info").await?;
    client.alive().await?;

    let info = client.server_info().await?;
    assert_eq!(info.actions_executed, 0);
    assert!(info.workspace.contains("stagehand-server-info"));

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[tokio::test]
async fn executes_commands_and_file_actions() -> Result<()> {
    let (client, root) = direct_server("actions").await?;

    let observation = client
        .execute(
            ExecuteRequest::new(Action::cmd("echo over the wire"), 10),
            CancellationToken::new(),
        )
        .await?;
    assert!(matches!(
        observation.kind,
        ObservationKind::CmdOutput { exit_code: 0, .. }
    ));
    assert!(observation.content.contains("over the wire"));

    client
        .execute(
            ExecuteRequest::new(Action::write("notes/todo.txt", "ship it\n"), 10),
            CancellationToken::new(),
        )
        .await?;
    assert_eq!(
        std::fs::read_to_string(root.join("notes/todo.txt"))?,
        "ship it\n"
    );

    let read = client
        .execute(
            ExecuteRequest::new(Action::read("notes/todo.txt"), 10),
            CancellationToken::new(),
        )
        .await?;
    assert!(read.content.contains("ship it"));
    assert_eq!(client.server_info().await?.actions_executed, 3);

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

#[tokio::test]
async fn error_kinds_survive_the_wire() -> Result<()> {
    let (client, root) = direct_server("errors").await?;

    let escape = client
        .execute(
            ExecuteRequest::new(Action::read("../../etc/passwd"), 10),
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(escape, Err(ExecutionError::PermissionDenied(_))));

    let missing = client
        .execute(
            ExecuteRequest::new(Action::read("nope.txt"), 10),
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(missing, Err(ExecutionError::NotFound(_))));

    let started = Instant::now();
    let slow = client
        .execute(
            ExecuteRequest::new(Action::cmd("sleep 30"), 1),
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(slow, Err(ExecutionError::Timeout { after_secs: 1 })));
    assert!(started.elapsed() < Duration::from_secs(10));

    std::fs::remove_dir_all(&root)?;
    Ok(())
}

struct Stuck;

#[async_trait]
impl ActionExecutor for Stuck {
    async fn execute(
        &self,
        _request: ExecuteRequest,
        _cancel: CancellationToken,
    ) -> ExecutionResult<Observation> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Observation::new(ObservationKind::Rejected, "too late"))
    }

    async fn alive(&self) -> ExecutionResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn watchdog_answers_for_a_stuck_executor() -> Result<()> {
    let state = ServerState::new(Arc::new(Stuck), "/nowhere")
        .with_watchdog_slack(Duration::from_millis(100));
    let addr = serve(state).await?;
    let client = HttpActionClient::new(format!("http://{addr}"))?;

    let started = Instant::now();
    let outcome = client
        .execute(
            ExecuteRequest::new(Action::message("ignored"), 1),
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(outcome, Err(ExecutionError::Timeout { after_secs: 1 })));
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn client_cancellation_returns_promptly() -> Result<()> {
    let (client, root) = direct_server("cancel").await?;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = client
        .execute(ExecuteRequest::new(Action::cmd("sleep 30"), 60), cancel)
        .await;
    assert!(matches!(outcome, Err(ExecutionError::Sandbox { .. })));
    assert!(started.elapsed() < Duration::from_secs(5));

    std::fs::remove_dir_all(&root)?;
    Ok(())
}
