//! Lifecycle driver: one state machine per session over a pluggable backend.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use stagehand_exec::{CancellationToken, ExecuteRequest, retry_idempotent};
use stagehand_protocol::{ExecutionError, ExecutionResult, Observation, SessionId};
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    BackendKind, ProvisionRequest, SandboxBackend, SandboxHandle, SandboxInstance, TeardownMode,
};
use crate::error::{CleanupFailure, SandboxError, SandboxResult};
use crate::state::{FailureStage, SandboxFailure, SandboxState};

#[derive(Default)]
struct SessionSlot {
    state: Mutex<SandboxState>,
    /// Held across provisioning and teardown so those never interleave for
    /// one session. Lock order: `instance`, then `state`.
    instance: Arc<tokio::sync::Mutex<Option<Arc<dyn SandboxInstance>>>>,
}

/// Closed sessions remembered so `state` keeps answering `Closed`.
const CLOSED_MEMORY: usize = 1024;

/// Owns every sandbox handle. Callers only ever see [`SandboxHandle`]
/// snapshots; a sandbox is never shared between sessions.
///
/// A slot lives from the first `acquire` until `close`; closed sessions
/// drop their slot and only their id is remembered, up to [`CLOSED_MEMORY`].
pub struct LifecycleManager {
    backend: Arc<dyn SandboxBackend>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionSlot>>>,
    closed: Mutex<IndexSet<SessionId>>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("backend", &self.backend.kind())
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl LifecycleManager {
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            sessions: Mutex::new(HashMap::new()),
            closed: Mutex::new(IndexSet::new()),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn state(&self, session_id: &SessionId) -> SandboxState {
        if let Some(slot) = self.existing_slot(session_id) {
            return slot.state.lock().clone();
        }
        if self.closed.lock().contains(session_id) {
            SandboxState::Closed
        } else {
            SandboxState::Uninitialized
        }
    }

    /// Sessions that currently hold a slot. Closed sessions are not listed.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Current handle, if the session has a live sandbox.
    pub async fn handle(&self, session_id: &SessionId) -> Option<SandboxHandle> {
        let slot = self.existing_slot(session_id)?;
        let instance = slot.instance.lock().await;
        let state = slot.state.lock().clone();
        instance
            .as_ref()
            .map(|instance| self.snapshot(session_id, instance.as_ref(), state))
    }

    /// Provision the session's sandbox on first use and wait until it is
    /// ready. Returns the existing handle when it already is.
    #[instrument(skip_all, fields(session_id = %session_id, backend = ?self.backend.kind()))]
    pub async fn acquire(&self, session_id: &SessionId) -> SandboxResult<SandboxHandle> {
        let (slot, mut instance) = loop {
            let slot = self.slot(session_id);
            let instance = Arc::clone(&slot.instance).lock_owned().await;
            // A close that finished while we waited dropped this slot.
            if self.is_current(session_id, &slot) {
                break (slot, instance);
            }
        };
        self.closed.lock().shift_remove(session_id);

        let current = slot.state.lock().clone();
        match &current {
            SandboxState::Ready | SandboxState::Executing => {
                if let Some(existing) = instance.as_ref() {
                    return Ok(self.snapshot(session_id, existing.as_ref(), current.clone()));
                }
                return Err(SandboxError {
                    stage: FailureStage::Execution,
                    cause: ExecutionError::sandbox("sandbox state lost its instance"),
                });
            }
            SandboxState::Error(failure) => {
                return Err(SandboxError {
                    stage: failure.stage,
                    cause: ExecutionError::sandbox(format!(
                        "sandbox failed earlier ({}); restart required",
                        failure.message
                    )),
                });
            }
            SandboxState::Uninitialized | SandboxState::Closed => {}
            SandboxState::Provisioning | SandboxState::Closing => {
                return Err(SandboxError::provisioning(ExecutionError::sandbox(format!(
                    "sandbox is busy: {current}"
                ))));
            }
        }

        transition(session_id, &mut slot.state.lock(), SandboxState::Provisioning);
        let request = ProvisionRequest {
            session_id: session_id.clone(),
        };
        let created: Arc<dyn SandboxInstance> = match self.backend.provision(&request).await {
            Ok(created) => Arc::from(created),
            Err(cause) => return Err(fail(session_id, &slot, FailureStage::Provisioning, cause)),
        };

        let policy = self.backend.readiness();
        let ready = match tokio::time::timeout(
            policy.deadline(),
            retry_idempotent(policy, "sandbox readiness", || created.probe()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout {
                after_secs: policy.deadline_secs,
            }),
        };
        if let Err(cause) = ready {
            log_cleanup(session_id, &created.teardown(TeardownMode::Release).await);
            return Err(fail(session_id, &slot, FailureStage::Provisioning, cause));
        }

        let handle = self.snapshot(session_id, created.as_ref(), SandboxState::Ready);
        *instance = Some(created);
        transition(session_id, &mut slot.state.lock(), SandboxState::Ready);
        info!(endpoint = ?handle.endpoint, workspace = %handle.workspace.display(), "sandbox ready");
        Ok(handle)
    }

    /// Run one action. The session must be `Ready`; at most one action is in
    /// flight per session. No retry happens here: a `Disconnected` error moves
    /// the session to `Error` until [`restart`](Self::restart).
    #[instrument(skip_all, fields(session_id = %session_id, action = request.action.kind.name()))]
    pub async fn execute(
        &self,
        session_id: &SessionId,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult<Observation> {
        let slot = self
            .existing_slot(session_id)
            .ok_or_else(|| ExecutionError::sandbox("no sandbox has been acquired"))?;
        let executor = {
            let instance = slot.instance.lock().await;
            let mut state = slot.state.lock();
            match (state.clone(), instance.as_ref()) {
                (SandboxState::Ready, Some(instance)) => {
                    transition(session_id, &mut state, SandboxState::Executing);
                    instance.executor()
                }
                (other, _) => {
                    return Err(ExecutionError::sandbox(format!("sandbox is not ready: {other}")));
                }
            }
        };

        let result = executor.execute(request, cancel).await;

        let mut state = slot.state.lock();
        // A concurrent close owns the state from here on.
        if matches!(*state, SandboxState::Executing) {
            let next = match &result {
                Err(error @ ExecutionError::Disconnected(_)) => {
                    warn!(error = %error, "sandbox disconnected during execution");
                    SandboxState::Error(SandboxFailure {
                        stage: FailureStage::Execution,
                        kind: error.kind(),
                        message: error.to_string(),
                    })
                }
                _ => SandboxState::Ready,
            };
            transition(session_id, &mut state, next);
        }
        result
    }

    /// Tear down whatever is there and provision afresh.
    pub async fn restart(&self, session_id: &SessionId) -> SandboxResult<SandboxHandle> {
        info!(session_id = %session_id, "restarting sandbox");
        self.close(session_id, TeardownMode::Release).await;
        self.acquire(session_id).await
    }

    /// Idempotent. Every teardown step runs even when earlier ones fail; the
    /// failures are logged and returned, and the session always ends `Closed`.
    #[instrument(skip_all, fields(session_id = %session_id, ?mode))]
    pub async fn close(&self, session_id: &SessionId, mode: TeardownMode) -> Vec<CleanupFailure> {
        let Some(slot) = self.existing_slot(session_id) else {
            debug!("no sandbox to close");
            self.remember_closed(session_id);
            return Vec::new();
        };
        let mut instance = slot.instance.lock().await;
        if !self.is_current(session_id, &slot) {
            debug!("sandbox already closed");
            return Vec::new();
        }
        transition(session_id, &mut slot.state.lock(), SandboxState::Closing);

        let failures = match instance.take() {
            Some(live) => live.teardown(mode).await,
            None => Vec::new(),
        };
        log_cleanup(session_id, &failures);
        transition(session_id, &mut slot.state.lock(), SandboxState::Closed);
        self.sessions.lock().remove(session_id);
        self.remember_closed(session_id);
        info!(failures = failures.len(), "sandbox closed");
        failures
    }

    /// Close every known session, e.g. on shutdown.
    pub async fn close_all(&self, mode: TeardownMode) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        for session_id in self.sessions() {
            failures.extend(self.close(&session_id, mode).await);
        }
        failures
    }

    fn slot(&self, session_id: &SessionId) -> Arc<SessionSlot> {
        Arc::clone(self.sessions.lock().entry(session_id.clone()).or_default())
    }

    fn existing_slot(&self, session_id: &SessionId) -> Option<Arc<SessionSlot>> {
        self.sessions.lock().get(session_id).cloned()
    }

    fn is_current(&self, session_id: &SessionId, slot: &Arc<SessionSlot>) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn remember_closed(&self, session_id: &SessionId) {
        let mut closed = self.closed.lock();
        closed.insert(session_id.clone());
        while closed.len() > CLOSED_MEMORY {
            closed.shift_remove_index(0);
        }
    }

    fn snapshot(
        &self,
        session_id: &SessionId,
        instance: &dyn SandboxInstance,
        state: SandboxState,
    ) -> SandboxHandle {
        SandboxHandle {
            session_id: session_id.clone(),
            backend: self.backend.kind(),
            endpoint: instance.endpoint(),
            workspace: instance.workspace().to_path_buf(),
            state,
        }
    }
}

fn transition(session_id: &SessionId, state: &mut SandboxState, next: SandboxState) {
    if !state.can_transition_to(&next) {
        warn!(session_id = %session_id, from = %state, to = %next, "unexpected sandbox transition");
    }
    debug!(session_id = %session_id, from = %state, to = %next, "sandbox transition");
    *state = next;
}

fn fail(
    session_id: &SessionId,
    slot: &SessionSlot,
    stage: FailureStage,
    cause: ExecutionError,
) -> SandboxError {
    warn!(session_id = %session_id, %stage, error = %cause, "sandbox failed");
    let failure = SandboxFailure {
        stage,
        kind: cause.kind(),
        message: cause.to_string(),
    };
    transition(session_id, &mut slot.state.lock(), SandboxState::Error(failure));
    SandboxError { stage, cause }
}

fn log_cleanup(session_id: &SessionId, failures: &[CleanupFailure]) {
    for failure in failures {
        warn!(session_id = %session_id, step = %failure.step, error = %failure.message, "cleanup step failed");
    }
}
