//! Local backend: one `stagehand-server` process per session on this host.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_exec::{ActionExecutor, BackoffPolicy, ExecutorConnector, retry_idempotent};
use stagehand_protocol::{ExecutionError, ExecutionResult};
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    BackendKind, Endpoint, ProvisionRequest, SandboxBackend, SandboxInstance, TeardownMode,
};
use crate::error::CleanupFailure;
use crate::pool::WarmPool;
use crate::process::terminate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// Worker program. `{port}` and `{workspace}` in `args` are substituted.
    pub command: String,
    pub args: Vec<String>,
    pub host: String,
    /// Shared workspace for every worker; a fresh temp directory otherwise.
    pub workspace: Option<PathBuf>,
    pub kill_grace_ms: u64,
    /// Idle warm workers kept around. Zero disables pooling.
    pub pool_size: usize,
    pub readiness: BackoffPolicy,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            command: "stagehand-server".into(),
            args: vec![
                "--port".into(),
                "{port}".into(),
                "--workspace".into(),
                "{workspace}".into(),
            ],
            host: "127.0.0.1".into(),
            workspace: None,
            kill_grace_ms: 2_000,
            pool_size: 0,
            readiness: BackoffPolicy::local(),
        }
    }
}

/// A running worker process and the executor that talks to it.
pub struct LocalWorker {
    child: tokio::sync::Mutex<Option<Child>>,
    base_url: String,
    workspace: PathBuf,
    owns_workspace: bool,
    executor: Arc<dyn ActionExecutor>,
}

impl std::fmt::Debug for LocalWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorker")
            .field("base_url", &self.base_url)
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

impl LocalWorker {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether the process is still running.
    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn stop(&self, grace: Duration) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        if let Some(mut child) = self.child.lock().await.take() {
            match terminate(&mut child, grace, true).await {
                Ok(status) => debug!(base_url = %self.base_url, %status, "worker stopped"),
                Err(e) => failures.push(CleanupFailure::new("terminate worker", e)),
            }
        }
        if self.owns_workspace {
            if let Err(e) = tokio::fs::remove_dir_all(&self.workspace).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    failures.push(CleanupFailure::new("remove workspace", e));
                }
            }
        }
        failures
    }
}

struct LocalShared {
    settings: LocalSettings,
    connector: Arc<dyn ExecutorConnector>,
    pool: Option<Arc<WarmPool<LocalWorker>>>,
}

impl LocalShared {
    fn grace(&self) -> Duration {
        Duration::from_millis(self.settings.kill_grace_ms)
    }

    fn free_port(&self) -> ExecutionResult<u16> {
        let listener = std::net::TcpListener::bind((self.settings.host.as_str(), 0))
            .map_err(|e| ExecutionError::sandbox_with("failed to find a free port", e))?;
        let port = listener
            .local_addr()
            .map_err(|e| ExecutionError::sandbox_with("failed to find a free port", e))?
            .port();
        Ok(port)
    }

    #[instrument(skip(self), fields(command = %self.settings.command))]
    async fn spawn_worker(&self) -> ExecutionResult<LocalWorker> {
        let port = self.free_port()?;
        let (workspace, owns_workspace) = match &self.settings.workspace {
            Some(path) => (path.clone(), false),
            None => (
                std::env::temp_dir().join(format!("stagehand-{}", uuid::Uuid::new_v4().simple())),
                true,
            ),
        };
        tokio::fs::create_dir_all(&workspace).await.map_err(|e| {
            ExecutionError::sandbox_with(format!("failed to create workspace {}", workspace.display()), e)
        })?;

        let workspace_arg = workspace.display().to_string();
        let args: Vec<String> = self
            .settings
            .args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{workspace}", &workspace_arg)
            })
            .collect();

        let child = Command::new(&self.settings.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutionError::sandbox_with(
                    format!("failed to start worker `{}`", self.settings.command),
                    e,
                )
            })?;

        let base_url = format!("http://{}:{port}", self.settings.host);
        let worker = LocalWorker {
            child: tokio::sync::Mutex::new(Some(child)),
            executor: self.connector.connect(&base_url)?,
            base_url,
            workspace,
            owns_workspace,
        };
        info!(base_url = %worker.base_url, "worker process started");
        Ok(worker)
    }

    async fn start_warm_worker(&self) -> ExecutionResult<LocalWorker> {
        let worker = self.spawn_worker().await?;
        let ready = retry_idempotent(&self.settings.readiness, "warm worker readiness", || {
            worker.executor.alive()
        })
        .await;
        match ready {
            Ok(()) => Ok(worker),
            Err(e) => {
                worker.stop(self.grace()).await;
                Err(e)
            }
        }
    }
}

/// Spawns (or claims from the warm pool) a worker per session.
#[derive(Clone)]
pub struct LocalBackend {
    shared: Arc<LocalShared>,
}

impl LocalBackend {
    pub fn new(settings: LocalSettings, connector: Arc<dyn ExecutorConnector>) -> Self {
        let pool = (settings.pool_size > 0).then(|| WarmPool::new(settings.pool_size));
        Self::with_pool(settings, connector, pool)
    }

    /// Use an externally owned pool, e.g. one shared by several backends.
    pub fn with_pool(
        settings: LocalSettings,
        connector: Arc<dyn ExecutorConnector>,
        pool: Option<Arc<WarmPool<LocalWorker>>>,
    ) -> Self {
        Self {
            shared: Arc::new(LocalShared {
                settings,
                connector,
                pool,
            }),
        }
    }

    pub fn pool(&self) -> Option<&Arc<WarmPool<LocalWorker>>> {
        self.shared.pool.as_ref()
    }

    /// Fill the warm pool with up to `count` ready workers.
    pub async fn prewarm(&self, count: usize) -> usize {
        let Some(pool) = &self.shared.pool else {
            return 0;
        };
        let shared = Arc::clone(&self.shared);
        pool.prewarm(count, || {
            let shared = Arc::clone(&shared);
            async move { shared.start_warm_worker().await }
        })
        .await
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn readiness(&self) -> &BackoffPolicy {
        &self.shared.settings.readiness
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    async fn provision(&self, request: &ProvisionRequest) -> ExecutionResult<Box<dyn SandboxInstance>> {
        if let Some(pool) = &self.shared.pool {
            while let Some(worker) = pool.claim() {
                if worker.is_running().await {
                    info!(base_url = %worker.base_url, "claimed warm worker");
                    return Ok(Box::new(LocalInstance {
                        worker,
                        shared: Arc::clone(&self.shared),
                    }));
                }
                warn!(base_url = %worker.base_url, "discarding dead warm worker");
                worker.stop(self.shared.grace()).await;
            }
        }
        let worker = self.shared.spawn_worker().await?;
        Ok(Box::new(LocalInstance {
            worker,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct LocalInstance {
    worker: LocalWorker,
    shared: Arc<LocalShared>,
}

#[async_trait]
impl SandboxInstance for LocalInstance {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Http {
            base_url: self.worker.base_url.clone(),
        }
    }

    fn workspace(&self) -> &Path {
        &self.worker.workspace
    }

    fn executor(&self) -> Arc<dyn ActionExecutor> {
        Arc::clone(&self.worker.executor)
    }

    async fn probe(&self) -> ExecutionResult<()> {
        if !self.worker.is_running().await {
            return Err(ExecutionError::sandbox("worker process exited"));
        }
        self.worker.executor.alive().await
    }

    async fn teardown(&self, _mode: TeardownMode) -> Vec<CleanupFailure> {
        let failures = self.worker.stop(self.shared.grace()).await;
        if let Some(reservation) = self.shared.pool.as_ref().and_then(|pool| pool.reserve()) {
            // The next session should not wait for a process to boot.
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                match shared.start_warm_worker().await {
                    Ok(worker) => {
                        debug!(base_url = %worker.base_url, "warm replacement ready");
                        reservation.fill(worker);
                    }
                    Err(e) => warn!(error = %e, "failed to start warm replacement"),
                }
            });
        }
        failures
    }
}
