//! Action-execution server: the process a Local or Cluster sandbox runs.
//!
//! `GET /alive`, `GET /server_info` and `POST /execute_action`, backed by a
//! [`DirectExecutor`] confined to the sandbox workspace. A watchdog bounds
//! every request by its action timeout, whatever the executor does.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use stagehand_exec::{
    ActionExecutor, AliveResponse, CancellationToken, ErrorResponse, ExecuteRequest,
    ExecuteResponse, ServerInfo, status_for,
};
use stagehand_protocol::ExecutionError;
use stagehand_sandbox::{DirectExecutor, ExecutorLimits, WorkspaceRoot};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Slack past the action timeout before the watchdog answers on the
/// executor's behalf.
pub const DEFAULT_WATCHDOG_SLACK: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct ServerState {
    executor: Arc<dyn ActionExecutor>,
    workspace: String,
    started: Instant,
    executed: Arc<AtomicU64>,
    watchdog_slack: Duration,
}

impl ServerState {
    pub fn new(executor: Arc<dyn ActionExecutor>, workspace: impl Into<String>) -> Self {
        Self {
            executor,
            workspace: workspace.into(),
            started: Instant::now(),
            executed: Arc::new(AtomicU64::new(0)),
            watchdog_slack: DEFAULT_WATCHDOG_SLACK,
        }
    }

    /// Serve actions from a [`DirectExecutor`] rooted at `workspace`.
    pub fn direct(workspace: WorkspaceRoot, limits: ExecutorLimits) -> anyhow::Result<Self> {
        let display = workspace.path().display().to_string();
        let executor = DirectExecutor::new(workspace, limits)?;
        Ok(Self::new(Arc::new(executor), display))
    }

    pub fn with_watchdog_slack(mut self, slack: Duration) -> Self {
        self.watchdog_slack = slack;
        self
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/alive", get(alive))
        .route("/server_info", get(server_info))
        .route("/execute_action", post(execute_action))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// An [`ExecutionError`] as an HTTP reply carrying its kind.
struct ExecError(ExecutionError);

impl IntoResponse for ExecError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(status_for(self.0.kind()))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: self.0.to_body(),
        };
        (status, Json(body)).into_response()
    }
}

async fn alive() -> Json<AliveResponse> {
    Json(AliveResponse::ok())
}

async fn server_info(State(state): State<ServerState>) -> Json<ServerInfo> {
    Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        uptime_secs: state.started.elapsed().as_secs(),
        workspace: state.workspace.clone(),
        actions_executed: state.executed.load(Ordering::Relaxed),
    })
}

async fn execute_action(
    State(state): State<ServerState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ExecError> {
    let action = request.action.kind.name();
    let timeout_secs = request.timeout_secs;
    let cancel = CancellationToken::new();
    // A dropped request (client gone) cancels the action too.
    let _guard = cancel.clone().drop_guard();

    let budget = Duration::from_secs(timeout_secs) + state.watchdog_slack;
    let result = tokio::time::timeout(budget, state.executor.execute(request, cancel.clone())).await;
    state.executed.fetch_add(1, Ordering::Relaxed);

    match result {
        Ok(Ok(observation)) => {
            info!(action, "action executed");
            Ok(Json(ExecuteResponse { observation }))
        }
        Ok(Err(error)) => {
            warn!(action, error = %error, "action failed");
            Err(ExecError(error))
        }
        Err(_) => {
            cancel.cancel();
            warn!(action, timeout_secs, "watchdog fired before the executor answered");
            Err(ExecError(ExecutionError::Timeout {
                after_secs: timeout_secs,
            }))
        }
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
