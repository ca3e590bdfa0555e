use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use stagehand_protocol::{ExecutionError, ExecutionResult};

use super::api::{ClusterApi, ClusterResource, PodPhase, ResourceKind, SESSION_LABEL};

/// How pods created in an [`InMemoryCluster`] behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PodBehavior {
    #[default]
    Running,
    /// Never scheduled.
    Pending,
    Failed,
}

#[derive(Default)]
struct ClusterState {
    resources: BTreeMap<(ResourceKind, String), ClusterResource>,
    pod_behavior: PodBehavior,
    failing_kind: Option<ResourceKind>,
    creates: usize,
}

/// In-process cluster for tests and offline runs.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pod_behavior(self, behavior: PodBehavior) -> Self {
        self.state.lock().pod_behavior = behavior;
        self
    }

    /// Make every create of `kind` fail from now on.
    pub fn fail_creates_of(&self, kind: ResourceKind) {
        self.state.lock().failing_kind = Some(kind);
    }

    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        self.state
            .lock()
            .resources
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        self.state.lock().resources.contains_key(&(kind, name.to_owned()))
    }

    /// Creates that actually added a resource.
    pub fn create_count(&self) -> usize {
        self.state.lock().creates
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get(&self, kind: ResourceKind, name: &str) -> ExecutionResult<Option<ClusterResource>> {
        Ok(self.state.lock().resources.get(&(kind, name.to_owned())).cloned())
    }

    async fn create(&self, resource: &ClusterResource) -> ExecutionResult<()> {
        let mut state = self.state.lock();
        if state.failing_kind == Some(resource.kind) {
            return Err(ExecutionError::sandbox(format!(
                "admission webhook denied {} {}",
                resource.kind, resource.name
            )));
        }
        let key = (resource.kind, resource.name.clone());
        if !state.resources.contains_key(&key) {
            state.resources.insert(key, resource.clone());
            state.creates += 1;
        }
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> ExecutionResult<()> {
        self.state.lock().resources.remove(&(kind, name.to_owned()));
        Ok(())
    }

    async fn list(&self, kind: ResourceKind, session_slug: &str) -> ExecutionResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .resources
            .values()
            .filter(|r| r.kind == kind && r.label(SESSION_LABEL) == Some(session_slug))
            .map(|r| r.name.clone())
            .collect())
    }

    async fn pod_phase(&self, name: &str) -> ExecutionResult<Option<PodPhase>> {
        let state = self.state.lock();
        if !state.resources.contains_key(&(ResourceKind::Pod, name.to_owned())) {
            return Ok(None);
        }
        Ok(Some(match state.pod_behavior {
            PodBehavior::Running => PodPhase::Running,
            PodBehavior::Pending => PodPhase::Pending,
            PodBehavior::Failed => PodPhase::Failed,
        }))
    }
}
