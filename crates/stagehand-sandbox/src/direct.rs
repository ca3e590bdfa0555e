//! In-process execution against a confined workspace directory.
//!
//! [`DirectExecutor`] is what actually performs actions: the Direct backend
//! calls it in-process, and `stagehand-server` wraps it behind the HTTP
//! protocol for the Local and Cluster backends.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_exec::{ActionExecutor, BackoffPolicy, CancellationToken, ExecuteRequest};
use stagehand_protocol::{
    ActionKind, ExecutionError, ExecutionResult, Observation, ObservationKind,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::backend::{
    BackendKind, Endpoint, ProvisionRequest, SandboxBackend, SandboxInstance, TeardownMode,
};
use crate::error::CleanupFailure;
use crate::process::terminate;
use crate::workspace::WorkspaceRoot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorLimits {
    /// Per stream (stdout and stderr each).
    pub max_output_bytes: usize,
    pub kill_grace_ms: u64,
    pub browse_timeout_secs: u64,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            max_output_bytes: 512 * 1024,
            kill_grace_ms: 2_000,
            browse_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectExecutor {
    workspace: WorkspaceRoot,
    limits: ExecutorLimits,
    http: reqwest::Client,
}

impl DirectExecutor {
    pub fn new(workspace: WorkspaceRoot, limits: ExecutorLimits) -> ExecutionResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(limits.browse_timeout_secs.max(1)))
            .build()
            .map_err(|e| ExecutionError::sandbox_with("failed to build HTTP client", e))?;
        Ok(Self {
            workspace,
            limits,
            http,
        })
    }

    pub fn workspace(&self) -> &WorkspaceRoot {
        &self.workspace
    }

    async fn run_command(
        &self,
        command: &str,
        cwd: Option<&str>,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult<Observation> {
        let dir = self.workspace.resolve(cwd.unwrap_or(""))?;
        if !tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(ExecutionError::NotFound(format!(
                "working directory {} does not exist",
                cwd.unwrap_or(".")
            )));
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::sandbox_with("failed to spawn shell", e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max = self.limits.max_output_bytes;

        enum Outcome {
            Finished(std::io::Result<std::process::ExitStatus>, Vec<u8>, Vec<u8>),
            TimedOut,
            Cancelled,
        }

        let outcome = {
            let run = async {
                let (out, err) = tokio::join!(read_bounded(stdout, max), read_bounded(stderr, max));
                let status = child.wait().await;
                Outcome::Finished(status, out, err)
            };
            tokio::select! {
                outcome = run => outcome,
                _ = tokio::time::sleep(limit) => Outcome::TimedOut,
                _ = cancel.cancelled() => Outcome::Cancelled,
            }
        };

        let grace = Duration::from_millis(self.limits.kill_grace_ms);
        match outcome {
            Outcome::Finished(status, out, err) => {
                let status = status
                    .map_err(|e| ExecutionError::sandbox_with("failed waiting for command", e))?;
                let mut content = String::from_utf8_lossy(&out).into_owned();
                if !err.is_empty() {
                    content.push_str(&String::from_utf8_lossy(&err));
                }
                let exit_code = status.code().unwrap_or(-1);
                debug!(exit_code, bytes = content.len(), "command finished");
                Ok(Observation::new(
                    ObservationKind::CmdOutput {
                        command: command.to_owned(),
                        exit_code,
                    },
                    content,
                ))
            }
            Outcome::TimedOut => {
                warn!(timeout_secs = limit.as_secs(), "command timed out, terminating");
                if let Err(e) = terminate(&mut child, grace, true).await {
                    warn!(error = %e, "failed to terminate timed out command");
                }
                Err(ExecutionError::Timeout {
                    after_secs: limit.as_secs(),
                })
            }
            Outcome::Cancelled => {
                if let Err(e) = terminate(&mut child, grace, true).await {
                    warn!(error = %e, "failed to terminate cancelled command");
                }
                Err(ExecutionError::sandbox("execution cancelled"))
            }
        }
    }

    async fn read_file(
        &self,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> ExecutionResult<Observation> {
        let resolved = self.workspace.resolve(path)?;
        let text = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| io_error(path, e))?;
        let content = match (start_line, end_line) {
            (None, None) => text,
            (start, end) => {
                let start = start.unwrap_or(1).max(1);
                let lines: Vec<&str> = text.lines().collect();
                let end = end.unwrap_or(lines.len()).min(lines.len());
                if start > end {
                    String::new()
                } else {
                    lines[start - 1..end].join("\n")
                }
            }
        };
        Ok(Observation::new(
            ObservationKind::FileRead {
                path: path.to_owned(),
            },
            content,
        ))
    }

    async fn write_file(&self, path: &str, content: &str) -> ExecutionResult<Observation> {
        let resolved = self.workspace.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(Observation::new(
            ObservationKind::FileWrite {
                path: path.to_owned(),
            },
            format!("wrote {} bytes to {path}", content.len()),
        ))
    }

    async fn edit_file(&self, path: &str, old_str: &str, new_str: &str) -> ExecutionResult<Observation> {
        if old_str.is_empty() {
            return Err(ExecutionError::sandbox("edit needs a non-empty old_str"));
        }
        let resolved = self.workspace.resolve(path)?;
        let text = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| io_error(path, e))?;
        match text.matches(old_str).count() {
            0 => Err(ExecutionError::NotFound(format!("old_str not found in {path}"))),
            1 => {
                let edited = text.replacen(old_str, new_str, 1);
                tokio::fs::write(&resolved, edited)
                    .await
                    .map_err(|e| io_error(path, e))?;
                Ok(Observation::new(
                    ObservationKind::FileEdit {
                        path: path.to_owned(),
                    },
                    format!("edited {path}"),
                ))
            }
            n => Err(ExecutionError::sandbox(format!(
                "old_str occurs {n} times in {path}; it must be unique"
            ))),
        }
    }

    async fn browse(&self, url: &str) -> ExecutionResult<Observation> {
        let response = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutionError::Timeout {
                    after_secs: self.limits.browse_timeout_secs,
                }
            } else {
                ExecutionError::sandbox_with(format!("failed to fetch {url}"), e)
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ExecutionError::sandbox_with(format!("failed to read {url}"), e))?;
        Ok(Observation::new(
            ObservationKind::Browse {
                url: url.to_owned(),
                status,
            },
            body,
        ))
    }
}

#[async_trait]
impl ActionExecutor for DirectExecutor {
    #[instrument(
        skip(self, request, cancel),
        fields(action = request.action.kind.name(), timeout_secs = request.timeout_secs)
    )]
    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult<Observation> {
        let limit = Duration::from_secs(request.timeout_secs);
        if let ActionKind::CmdRun { command, cwd } = &request.action.kind {
            return self.run_command(command, cwd.as_deref(), limit, &cancel).await;
        }

        let work = async {
            match &request.action.kind {
                ActionKind::FileRead {
                    path,
                    start_line,
                    end_line,
                } => self.read_file(path, *start_line, *end_line).await,
                ActionKind::FileWrite { path, content } => self.write_file(path, content).await,
                ActionKind::FileEdit {
                    path,
                    old_str,
                    new_str,
                } => self.edit_file(path, old_str, new_str).await,
                ActionKind::BrowseUrl { url } => self.browse(url).await,
                other => Err(ExecutionError::sandbox(format!(
                    "{} actions are recorded, not executed",
                    other.name()
                ))),
            }
        };
        tokio::select! {
            result = work => result,
            _ = tokio::time::sleep(limit) => Err(ExecutionError::Timeout { after_secs: limit.as_secs() }),
            _ = cancel.cancelled() => Err(ExecutionError::sandbox("execution cancelled")),
        }
    }

    async fn alive(&self) -> ExecutionResult<()> {
        match tokio::fs::metadata(self.workspace.path()).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ExecutionError::Disconnected("workspace is not a directory".into())),
            Err(e) => Err(ExecutionError::Disconnected(format!("workspace unavailable: {e}"))),
        }
    }
}

async fn read_bounded<R>(reader: Option<R>, max: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut buf = Vec::new();
    let mut chunk = vec![0_u8; 64 * 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep draining past the cap so the child never blocks on a full pipe.
                let room = max.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buf
}

fn io_error(path: &str, error: std::io::Error) -> ExecutionError {
    match error.kind() {
        std::io::ErrorKind::NotFound => ExecutionError::NotFound(path.to_owned()),
        std::io::ErrorKind::PermissionDenied => ExecutionError::PermissionDenied(path.to_owned()),
        _ => ExecutionError::sandbox_with(format!("i/o error on {path}"), error),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectSettings {
    /// Per-session workspaces are created under this directory.
    pub base_dir: PathBuf,
    /// Use this directory for every session instead of `base_dir/<session>`.
    pub workspace: Option<PathBuf>,
    pub limits: ExecutorLimits,
    pub readiness: BackoffPolicy,
}

impl Default for DirectSettings {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("stagehand-workspaces"),
            workspace: None,
            limits: ExecutorLimits::default(),
            readiness: BackoffPolicy::local(),
        }
    }
}

/// No isolation: actions run as the current user against a confined
/// directory. No process outlives a single action.
#[derive(Debug, Clone)]
pub struct DirectBackend {
    settings: DirectSettings,
}

impl DirectBackend {
    pub fn new(settings: DirectSettings) -> Self {
        Self { settings }
    }

    fn workspace_for(&self, request: &ProvisionRequest) -> PathBuf {
        match &self.settings.workspace {
            Some(path) => path.clone(),
            None => self.settings.base_dir.join(request.session_id.slug()),
        }
    }
}

#[async_trait]
impl SandboxBackend for DirectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    fn readiness(&self) -> &BackoffPolicy {
        &self.settings.readiness
    }

    async fn provision(&self, request: &ProvisionRequest) -> ExecutionResult<Box<dyn SandboxInstance>> {
        let workspace = WorkspaceRoot::prepare(self.workspace_for(request))?;
        let executor = Arc::new(DirectExecutor::new(workspace, self.settings.limits.clone())?);
        Ok(Box::new(DirectInstance { executor }))
    }
}

struct DirectInstance {
    executor: Arc<DirectExecutor>,
}

#[async_trait]
impl SandboxInstance for DirectInstance {
    fn endpoint(&self) -> Endpoint {
        Endpoint::InProcess
    }

    fn workspace(&self) -> &Path {
        self.executor.workspace().path()
    }

    fn executor(&self) -> Arc<dyn ActionExecutor> {
        self.executor.clone()
    }

    async fn probe(&self) -> ExecutionResult<()> {
        self.executor.alive().await
    }

    async fn teardown(&self, mode: TeardownMode) -> Vec<CleanupFailure> {
        // Commands never outlive an action; the workspace is user data and stays.
        debug!(?mode, workspace = %self.workspace().display(), "direct sandbox released");
        Vec::new()
    }
}
