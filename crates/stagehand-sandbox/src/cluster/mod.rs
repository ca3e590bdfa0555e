//! Cluster backend: one pod (plus storage, services and an optional ingress)
//! per session.

pub mod api;
pub mod kubernetes;
pub mod manifest;
pub mod memory;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_exec::{ActionExecutor, BackoffPolicy, ExecutorConnector};
use stagehand_protocol::{ExecutionError, ExecutionResult};
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    BackendKind, Endpoint, ProvisionRequest, SandboxBackend, SandboxInstance, TeardownMode,
};
use crate::error::CleanupFailure;

pub use api::{ClusterApi, ClusterResource, PodPhase, ResourceKind, SESSION_LABEL};
pub use kubernetes::KubernetesApi;
pub use manifest::ResourceNames;
pub use memory::{InMemoryCluster, PodBehavior};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub api_url: String,
    pub namespace: String,
    pub image: String,
    /// Expose the dev-tool service at `<session>.<host>` when set.
    pub ingress_host: Option<String>,
    pub storage_size: String,
    pub storage_class: Option<String>,
    pub cpu_request: String,
    pub memory_request: String,
    pub protocol_port: u16,
    pub tools_port: u16,
    pub workspace_mount: PathBuf,
    /// How the manager reaches a session's protocol service. `{service}`,
    /// `{namespace}` and `{port}` are substituted.
    pub endpoint_template: String,
    pub readiness: BackoffPolicy,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".into(),
            namespace: "stagehand".into(),
            image: "ghcr.io/stagehand-dev/stagehand-server:latest".into(),
            ingress_host: None,
            storage_size: "2Gi".into(),
            storage_class: None,
            cpu_request: "500m".into(),
            memory_request: "1Gi".into(),
            protocol_port: 60_000,
            tools_port: 60_001,
            workspace_mount: PathBuf::from("/workspace"),
            endpoint_template: "http://{service}.{namespace}.svc.cluster.local:{port}".into(),
            readiness: BackoffPolicy::cluster(),
        }
    }
}

impl ClusterSettings {
    fn endpoint_for(&self, names: &ResourceNames) -> String {
        self.endpoint_template
            .replace("{service}", &names.service)
            .replace("{namespace}", &self.namespace)
            .replace("{port}", &self.protocol_port.to_string())
    }
}

pub struct ClusterBackend {
    settings: ClusterSettings,
    api: Arc<dyn ClusterApi>,
    connector: Arc<dyn ExecutorConnector>,
}

impl ClusterBackend {
    pub fn new(
        settings: ClusterSettings,
        api: Arc<dyn ClusterApi>,
        connector: Arc<dyn ExecutorConnector>,
    ) -> Self {
        Self {
            settings,
            api,
            connector,
        }
    }

    async fn ensure(&self, resource: &ClusterResource) -> ExecutionResult<()> {
        if self.api.get(resource.kind, &resource.name).await?.is_some() {
            debug!(kind = %resource.kind, name = %resource.name, "reusing existing resource");
            return Ok(());
        }
        self.api.create(resource).await?;
        debug!(kind = %resource.kind, name = %resource.name, "resource created");
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for ClusterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    fn readiness(&self) -> &BackoffPolicy {
        &self.settings.readiness
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id, namespace = %self.settings.namespace))]
    async fn provision(&self, request: &ProvisionRequest) -> ExecutionResult<Box<dyn SandboxInstance>> {
        let names = ResourceNames::for_session(&request.session_id, self.settings.ingress_host.is_some());
        let base_url = self.settings.endpoint_for(&names);
        let instance = ClusterInstance {
            executor: self.connector.connect(&base_url)?,
            api: Arc::clone(&self.api),
            workspace: self.settings.workspace_mount.clone(),
            base_url,
            names,
        };

        for resource in manifest::plan(&instance.names, &self.settings) {
            if let Err(error) = self.ensure(&resource).await {
                warn!(kind = %resource.kind, name = %resource.name, error = %error, "provisioning failed, cleaning up");
                for failure in instance.teardown(TeardownMode::Release).await {
                    warn!(step = %failure.step, error = %failure.message, "cleanup step failed");
                }
                return Err(error);
            }
        }
        info!(pod = %instance.names.pod, "cluster resources in place");
        Ok(Box::new(instance))
    }
}

struct ClusterInstance {
    api: Arc<dyn ClusterApi>,
    names: ResourceNames,
    base_url: String,
    workspace: PathBuf,
    executor: Arc<dyn ActionExecutor>,
}

#[async_trait]
impl SandboxInstance for ClusterInstance {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Http {
            base_url: self.base_url.clone(),
        }
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn executor(&self) -> Arc<dyn ActionExecutor> {
        Arc::clone(&self.executor)
    }

    async fn probe(&self) -> ExecutionResult<()> {
        match self.api.pod_phase(&self.names.pod).await? {
            Some(PodPhase::Running) => self.executor.alive().await,
            Some(phase) if phase.is_terminal() => Err(ExecutionError::sandbox(format!(
                "pod {} ended in phase {phase}",
                self.names.pod
            ))),
            Some(phase) => Err(ExecutionError::Disconnected(format!(
                "pod {} is {phase}",
                self.names.pod
            ))),
            None => Err(ExecutionError::Disconnected(format!(
                "pod {} does not exist yet",
                self.names.pod
            ))),
        }
    }

    async fn teardown(&self, mode: TeardownMode) -> Vec<CleanupFailure> {
        let mut targets = self.names.compute();
        if mode == TeardownMode::Archive {
            targets.push((ResourceKind::PersistentVolumeClaim, self.names.volume_claim.as_str()));
        }
        let mut failures = Vec::new();
        for (kind, name) in targets {
            if let Err(error) = self.api.delete(kind, name).await {
                failures.push(CleanupFailure::new(format!("delete {kind} {name}"), error));
            }
        }
        failures
    }
}
