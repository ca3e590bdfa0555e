//! # stagehand-kernel: session facade
//!
//! [`KernelBuilder`] turns a [`KernelConfig`] into a [`Kernel`]: one page
//! store, one sandbox backend behind a [`LifecycleManager`], and per
//! session an [`EventStream`] plus a [`SessionController`].

pub mod config;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use stagehand_events::{
    EventStream, EventSubscriber, FilePageStore, InMemoryPageStore, PageStore, SearchQuery,
    SubscriberKind, SubscriptionId,
};
use stagehand_exec::{ExecutorConnector, HttpConnector};
use stagehand_protocol::{Action, Event, EventId, SessionId};
use stagehand_runtime::{PatternAnalyzer, SecurityAnalyzer, SessionController, StepOutcome};
use stagehand_sandbox::cluster::kubernetes::{SERVICE_ACCOUNT_CA, SERVICE_ACCOUNT_TOKEN};
use stagehand_sandbox::{
    BackendKind, CleanupFailure, ClusterApi, ClusterBackend, DirectBackend, KubernetesApi,
    LifecycleManager, LocalBackend, SandboxBackend, SandboxHandle, SandboxState, TeardownMode,
};
use tracing::{info, instrument, warn};

pub use config::{ConfigError, KernelConfig, StoreKind};

pub struct KernelBuilder {
    config: KernelConfig,
    page_store: Option<Arc<dyn PageStore>>,
    backend: Option<Arc<dyn SandboxBackend>>,
    connector: Option<Arc<dyn ExecutorConnector>>,
    cluster_api: Option<Arc<dyn ClusterApi>>,
    analyzer: Option<Arc<dyn SecurityAnalyzer>>,
    secrets: Vec<String>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            page_store: None,
            backend: None,
            connector: None,
            cluster_api: None,
            analyzer: None,
            secrets: Vec::new(),
        }
    }

    pub fn page_store(mut self, store: Arc<dyn PageStore>) -> Self {
        self.page_store = Some(store);
        self
    }

    /// Use this backend instead of the one named in the configuration.
    pub fn backend(mut self, backend: Arc<dyn SandboxBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn ExecutorConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn cluster_api(mut self, api: Arc<dyn ClusterApi>) -> Self {
        self.cluster_api = Some(api);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn SecurityAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn secret(mut self, value: impl Into<String>) -> Self {
        self.secrets.push(value.into());
        self
    }

    pub fn build(self) -> Result<Kernel> {
        self.config.validate()?;

        let page_store: Arc<dyn PageStore> = match self.page_store {
            Some(store) => store,
            None => match self.config.stream.store {
                StoreKind::File => Arc::new(FilePageStore::new(self.config.stream.root.clone())),
                StoreKind::Memory => Arc::new(InMemoryPageStore::new()),
            },
        };

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(HttpConnector::new()));
        let mut local = None;
        let backend: Arc<dyn SandboxBackend> = match self.backend {
            Some(backend) => backend,
            None => match self.config.sandbox.backend {
                BackendKind::Direct => {
                    Arc::new(DirectBackend::new(self.config.sandbox.direct.clone()))
                }
                BackendKind::Local => {
                    let backend =
                        LocalBackend::new(self.config.sandbox.local.clone(), connector);
                    local = Some(backend.clone());
                    Arc::new(backend)
                }
                BackendKind::Cluster => {
                    let api = match self.cluster_api {
                        Some(api) => api,
                        None => default_cluster_api(&self.config)?,
                    };
                    Arc::new(ClusterBackend::new(
                        self.config.sandbox.cluster.clone(),
                        api,
                        connector,
                    ))
                }
            },
        };

        let analyzer = match self.analyzer {
            Some(analyzer) => Some(analyzer),
            None if self.config.security.rules.is_empty() => None,
            None => {
                let analyzer: Arc<dyn SecurityAnalyzer> =
                    Arc::new(PatternAnalyzer::new(self.config.security.rules.clone()));
                Some(analyzer)
            }
        };

        let mut secrets = self.config.resolve_secrets();
        secrets.extend(self.secrets);

        info!(backend = ?backend.kind(), "kernel built");
        Ok(Kernel {
            inner: Arc::new(KernelInner {
                config: self.config,
                page_store,
                sandboxes: Arc::new(LifecycleManager::new(backend)),
                local,
                analyzer,
                secrets,
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }
}

fn default_cluster_api(config: &KernelConfig) -> Result<Arc<dyn ClusterApi>> {
    let cluster = &config.sandbox.cluster;
    let token = Path::new(SERVICE_ACCOUNT_TOKEN);
    let api = if token.exists() {
        KubernetesApi::from_service_account(
            cluster.api_url.clone(),
            cluster.namespace.clone(),
            token,
            Path::new(SERVICE_ACCOUNT_CA),
        )
    } else {
        KubernetesApi::new(cluster.api_url.clone(), cluster.namespace.clone(), None)
    };
    let api = api.context("failed to configure the cluster API client")?;
    Ok(Arc::new(api))
}

struct KernelInner {
    config: KernelConfig,
    page_store: Arc<dyn PageStore>,
    sandboxes: Arc<LifecycleManager>,
    local: Option<LocalBackend>,
    analyzer: Option<Arc<dyn SecurityAnalyzer>>,
    secrets: Vec<String>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionController>>>,
}

#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.sandboxes.backend_kind()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.inner.sessions.lock().keys().cloned().collect()
    }

    /// Start `count` warm workers when the Local backend pools them.
    pub async fn prewarm(&self, count: usize) -> usize {
        match &self.inner.local {
            Some(local) => local.prewarm(count).await,
            None => 0,
        }
    }

    /// Open (or reattach to) a session. Its stream resumes from whatever
    /// the page store already holds for that id.
    #[instrument(skip(self))]
    pub async fn open_session(&self, session_id: Option<SessionId>) -> Result<SessionId> {
        let session_id = session_id.unwrap_or_else(SessionId::new_uuid);
        if self.inner.sessions.lock().contains_key(&session_id) {
            return Ok(session_id);
        }

        let stream = EventStream::open(
            session_id.clone(),
            Arc::clone(&self.inner.page_store),
            self.inner.config.stream.stream_config(),
        )
        .await
        .with_context(|| format!("failed to open event stream for session {session_id}"))?;
        stream.secrets().set(self.inner.secrets.iter().cloned());

        let mut controller = SessionController::new(
            stream,
            Arc::clone(&self.inner.sandboxes),
            self.inner.config.limits.clone(),
            self.inner.config.execution.clone(),
        );
        if let Some(analyzer) = &self.inner.analyzer {
            controller = controller.with_analyzer(Arc::clone(analyzer));
        }

        let mut sessions = self.inner.sessions.lock();
        if sessions.contains_key(&session_id) {
            return Ok(session_id);
        }
        sessions.insert(session_id.clone(), Arc::new(controller));
        info!(session_id = %session_id, "session opened");
        Ok(session_id)
    }

    fn controller(&self, session_id: &SessionId) -> Result<Arc<SessionController>> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown session {session_id}"))
    }

    /// The session's stream, for streaming search or direct appends.
    pub fn stream(&self, session_id: &SessionId) -> Result<EventStream> {
        Ok(self.controller(session_id)?.stream().clone())
    }

    pub async fn submit(&self, session_id: &SessionId, action: Action) -> Result<StepOutcome> {
        let controller = self.controller(session_id)?;
        Ok(controller.submit(action).await?)
    }

    pub async fn submit_with_timeout(
        &self,
        session_id: &SessionId,
        action: Action,
        timeout_secs: u64,
    ) -> Result<StepOutcome> {
        let controller = self.controller(session_id)?;
        Ok(controller
            .submit_with_timeout(action, Some(timeout_secs))
            .await?)
    }

    pub async fn resolve_confirmation(
        &self,
        session_id: &SessionId,
        action_id: EventId,
        approve: bool,
    ) -> Result<StepOutcome> {
        let controller = self.controller(session_id)?;
        Ok(controller.resolve_confirmation(action_id, approve).await?)
    }

    pub async fn pending_confirmations(&self, session_id: &SessionId) -> Result<Vec<EventId>> {
        Ok(self.controller(session_id)?.pending_confirmations().await)
    }

    pub async fn record_spend(&self, session_id: &SessionId, amount: f64) -> Result<()> {
        self.controller(session_id)?.record_spend(amount).await;
        Ok(())
    }

    pub async fn extend_limits(&self, session_id: &SessionId) -> Result<()> {
        self.controller(session_id)?.extend_limits().await;
        Ok(())
    }

    pub fn cancel(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self.controller(session_id)?.cancel())
    }

    pub async fn restart_sandbox(&self, session_id: &SessionId) -> Result<SandboxHandle> {
        let controller = self.controller(session_id)?;
        Ok(controller.restart_sandbox().await?)
    }

    pub fn subscribe(
        &self,
        session_id: &SessionId,
        kind: SubscriberKind,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Result<SubscriptionId> {
        Ok(self.controller(session_id)?.stream().subscribe(kind, subscriber))
    }

    pub fn unsubscribe(&self, session_id: &SessionId, id: SubscriptionId) -> Result<bool> {
        Ok(self.controller(session_id)?.stream().unsubscribe(id))
    }

    pub async fn get_event(&self, session_id: &SessionId, id: EventId) -> Result<Event> {
        let stream = self.stream(session_id)?;
        Ok(stream.get(id).await?)
    }

    pub async fn search(&self, session_id: &SessionId, query: SearchQuery) -> Result<Vec<Event>> {
        let stream = self.stream(session_id)?;
        Ok(stream.search_collect(query).await?)
    }

    pub fn sandbox_state(&self, session_id: &SessionId) -> SandboxState {
        self.inner.sandboxes.state(session_id)
    }

    /// Cancel in-flight work and wait for its observation to be logged, tear
    /// the sandbox down, then drop every subscription and close the stream.
    /// Closing an unknown or already closed session only tears down whatever
    /// sandbox is left.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn close_session(
        &self,
        session_id: &SessionId,
        mode: TeardownMode,
    ) -> Vec<CleanupFailure> {
        let controller = self.inner.sessions.lock().remove(session_id);
        if let Some(controller) = &controller {
            controller.close();
            if let Err(error) = controller.drain().await {
                warn!(session_id = %session_id, %error, "in-flight outcome not recorded");
            }
        }

        let failures = self.inner.sandboxes.close(session_id, mode).await;
        if !failures.is_empty() {
            warn!(session_id = %session_id, failures = failures.len(), "session closed with cleanup failures");
        }

        if let Some(controller) = controller {
            controller.stream().close().await;
            info!(session_id = %session_id, "session closed");
        }
        failures
    }

    /// Close every open session.
    pub async fn shutdown(&self, mode: TeardownMode) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        for session_id in self.sessions() {
            failures.extend(self.close_session(&session_id, mode).await);
        }
        failures.extend(self.inner.sandboxes.close_all(mode).await);
        failures
    }
}
