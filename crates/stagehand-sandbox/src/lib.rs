//! # stagehand-sandbox: sandbox lifecycle management
//!
//! [`LifecycleManager`] drives one state machine per session
//! (`Uninitialized → Provisioning → Ready ⇄ Executing → Closing → Closed`,
//! with `Error` reachable while provisioning or running) over a
//! [`SandboxBackend`] strategy:
//!
//! - [`DirectBackend`] runs actions in-process against a confined directory.
//! - [`LocalBackend`] spawns a `stagehand-server` process per session, with
//!   an optional [`WarmPool`] of ready workers.
//! - [`ClusterBackend`] creates a pod, volume claim, services and optional
//!   ingress through a [`ClusterApi`].

pub mod backend;
pub mod cluster;
pub mod direct;
pub mod error;
pub mod local;
pub mod manager;
pub mod pool;
pub mod process;
pub mod state;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use backend::{
    BackendKind, Endpoint, ProvisionRequest, SandboxBackend, SandboxHandle, SandboxInstance,
    TeardownMode,
};
pub use cluster::{
    ClusterApi, ClusterBackend, ClusterResource, ClusterSettings, InMemoryCluster, KubernetesApi,
    PodBehavior, PodPhase, ResourceKind,
};
pub use direct::{DirectBackend, DirectExecutor, DirectSettings, ExecutorLimits};
pub use error::{CleanupFailure, SandboxError, SandboxResult};
pub use local::{LocalBackend, LocalSettings, LocalWorker};
pub use manager::LifecycleManager;
pub use pool::{PoolReservation, WarmPool};
pub use process::terminate;
pub use state::{FailureStage, SandboxFailure, SandboxState};
pub use workspace::WorkspaceRoot;
