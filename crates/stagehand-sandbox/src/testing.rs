//! Scripted executor shared by the backend and manager tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use stagehand_exec::{ActionExecutor, CancellationToken, ExecuteRequest};
use stagehand_protocol::{ExecutionError, ExecutionResult, Observation, ObservationKind};

/// Replays queued liveness and execute outcomes; healthy once a queue is empty.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    alive: Mutex<VecDeque<ExecutionResult<()>>>,
    executions: Mutex<VecDeque<ExecutionResult<Observation>>>,
    pub(crate) alive_calls: AtomicUsize,
    pub(crate) execute_calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn never_alive() -> Arc<Self> {
        let executor = Self::default();
        for _ in 0..1_000 {
            executor
                .alive
                .lock()
                .push_back(Err(ExecutionError::Disconnected("connection refused".into())));
        }
        Arc::new(executor)
    }

    pub(crate) fn push_alive(&self, result: ExecutionResult<()>) {
        self.alive.lock().push_back(result);
    }

    pub(crate) fn push_execution(&self, result: ExecutionResult<Observation>) {
        self.executions.lock().push_back(result);
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        request: ExecuteRequest,
        _cancel: CancellationToken,
    ) -> ExecutionResult<Observation> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.executions.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Observation::new(
                ObservationKind::CmdOutput {
                    command: request.action.kind.name().to_owned(),
                    exit_code: 0,
                },
                "ok",
            ))
        })
    }

    async fn alive(&self) -> ExecutionResult<()> {
        self.alive_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.alive.lock().pop_front();
        scripted.unwrap_or(Ok(()))
    }
}
