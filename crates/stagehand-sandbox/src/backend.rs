//! Strategy traits the lifecycle manager drives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_exec::{ActionExecutor, BackoffPolicy};
use stagehand_protocol::{ExecutionResult, SessionId};

use crate::error::CleanupFailure;
use crate::state::SandboxState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Direct,
    Cluster,
}

/// How the manager reaches a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum Endpoint {
    InProcess,
    Http { base_url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownMode {
    /// Free compute, keep persistent storage so the session can be re-attached.
    #[default]
    Release,
    /// The session is gone for good; persistent storage goes too.
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub session_id: SessionId,
}

/// Snapshot of a session's sandbox as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxHandle {
    pub session_id: SessionId,
    pub backend: BackendKind,
    pub endpoint: Endpoint,
    pub workspace: PathBuf,
    pub state: SandboxState,
}

/// One provisioned backend instance, owned by the lifecycle manager.
#[async_trait]
pub trait SandboxInstance: Send + Sync {
    fn endpoint(&self) -> Endpoint;

    /// Workspace location as seen from inside the sandbox.
    fn workspace(&self) -> &Path;

    fn executor(&self) -> Arc<dyn ActionExecutor>;

    /// One readiness check. Transient errors mean "not ready yet".
    async fn probe(&self) -> ExecutionResult<()>;

    /// Release everything this instance created. Runs every step even when an
    /// earlier one fails, and must tolerate being called more than once.
    async fn teardown(&self, mode: TeardownMode) -> Vec<CleanupFailure>;
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn readiness(&self) -> &BackoffPolicy;

    /// Create the backend resources for a session. On error, anything
    /// partially created must already be cleaned up.
    async fn provision(&self, request: &ProvisionRequest) -> ExecutionResult<Box<dyn SandboxInstance>>;
}
