//! The executor contract and its JSON wire types.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_protocol::{Action, ErrorBody, ExecutionErrorKind, ExecutionResult, Observation};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub action: Action,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_ACTION_TIMEOUT_SECS
}

impl ExecuteRequest {
    pub fn new(action: Action, timeout_secs: u64) -> Self {
        Self {
            action,
            timeout_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub observation: Observation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliveResponse {
    pub status: String,
}

impl AliveResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub uptime_secs: u64,
    pub workspace: String,
    pub actions_executed: u64,
}

/// HTTP status the server answers with for each error kind.
pub fn status_for(kind: ExecutionErrorKind) -> u16 {
    match kind {
        ExecutionErrorKind::PermissionDenied => 403,
        ExecutionErrorKind::NotFound => 404,
        ExecutionErrorKind::Timeout => 504,
        ExecutionErrorKind::Disconnected => 503,
        ExecutionErrorKind::Sandbox => 500,
    }
}

/// Inverse of [`status_for`], used when an error reply carries no body.
pub fn kind_for_status(status: u16) -> ExecutionErrorKind {
    match status {
        403 => ExecutionErrorKind::PermissionDenied,
        404 => ExecutionErrorKind::NotFound,
        408 | 504 => ExecutionErrorKind::Timeout,
        502 | 503 => ExecutionErrorKind::Disconnected,
        _ => ExecutionErrorKind::Sandbox,
    }
}

/// Runs actions inside one sandbox.
///
/// `execute` is never retried by callers: a command may have side effects
/// even when the reply is lost.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult<Observation>;

    async fn alive(&self) -> ExecutionResult<()>;
}

/// Builds executors for sandbox endpoints reachable over the network.
pub trait ExecutorConnector: Send + Sync {
    fn connect(&self, base_url: &str) -> ExecutionResult<Arc<dyn ActionExecutor>>;
}

/// Connector backed by a closure, for wiring in-process or scripted executors.
pub struct FnConnector<F>(F);

impl<F> FnConnector<F>
where
    F: Fn(&str) -> ExecutionResult<Arc<dyn ActionExecutor>> + Send + Sync,
{
    pub fn new(connect: F) -> Self {
        Self(connect)
    }
}

impl<F> ExecutorConnector for FnConnector<F>
where
    F: Fn(&str) -> ExecutionResult<Arc<dyn ActionExecutor>> + Send + Sync,
{
    fn connect(&self, base_url: &str) -> ExecutionResult<Arc<dyn ActionExecutor>> {
        (self.0)(base_url)
    }
}
