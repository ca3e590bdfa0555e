//! The container-orchestration substrate the cluster backend talks to.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_protocol::ExecutionResult;

/// Label carrying the owning session's slug on every created resource.
pub const SESSION_LABEL: &str = "stagehand.dev/session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Pod,
    PersistentVolumeClaim,
    Service,
    Ingress,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Pod => "pod",
            ResourceKind::PersistentVolumeClaim => "persistent volume claim",
            ResourceKind::Service => "service",
            ResourceKind::Ingress => "ingress",
        };
        f.write_str(name)
    }
}

/// A named object together with the manifest it was (or will be) created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResource {
    pub kind: ResourceKind,
    pub name: String,
    pub manifest: Value,
}

impl ClusterResource {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.manifest
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// The pod will never become ready on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Minimal resource API. Implementations scope every call to one namespace.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(&self, kind: ResourceKind, name: &str) -> ExecutionResult<Option<ClusterResource>>;

    /// Creating a resource that already exists is not an error.
    async fn create(&self, resource: &ClusterResource) -> ExecutionResult<()>;

    /// Deleting a resource that does not exist is not an error.
    async fn delete(&self, kind: ResourceKind, name: &str) -> ExecutionResult<()>;

    /// Names of the resources of `kind` labelled with `session_slug`.
    async fn list(&self, kind: ResourceKind, session_slug: &str) -> ExecutionResult<Vec<String>>;

    /// `None` when the pod does not exist.
    async fn pod_phase(&self, name: &str) -> ExecutionResult<Option<PodPhase>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn labels_are_read_from_metadata() {
        let resource = ClusterResource {
            kind: ResourceKind::Pod,
            name: "stagehand-a".into(),
            manifest: json!({"metadata": {"labels": {SESSION_LABEL: "a"}}}),
        };
        assert_eq!(resource.label(SESSION_LABEL), Some("a"));
        assert_eq!(resource.label("app"), None);
    }

    #[test]
    fn unknown_phases_are_not_terminal() {
        assert_eq!(PodPhase::parse("Running"), PodPhase::Running);
        assert_eq!(PodPhase::parse("CrashLoop"), PodPhase::Unknown);
        assert!(PodPhase::Failed.is_terminal());
        assert!(!PodPhase::Unknown.is_terminal());
    }
}
