//! Per-session controller: gate, assess, confirm, execute, observe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use stagehand_events::{EventStream, StreamError};
use stagehand_exec::{CancellationToken, DEFAULT_ACTION_TIMEOUT_SECS, ExecuteRequest};
use stagehand_protocol::{
    Action, ConfirmationStatus, DEFAULT_MAX_OBSERVATION_CHARS, EventDraft, EventId, EventSource,
    ExecutionError, Observation, ObservationKind, SecurityRisk, SessionId,
};
use stagehand_sandbox::{LifecycleManager, SandboxHandle, SandboxResult};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::analyzer::SecurityAnalyzer;
use crate::flags::{BudgetFlag, FlagError, IterationFlag};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_iterations: u64,
    pub iteration_increase: u64,
    /// No budget gate when unset.
    pub max_budget: Option<f64>,
    pub budget_increase: f64,
    /// Nobody is watching: a reached limit ends the session.
    pub headless: bool,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            iteration_increase: 50,
            max_budget: None,
            budget_increase: 5.0,
            headless: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub default_timeout_secs: u64,
    pub max_observation_chars: usize,
    /// Every runnable action waits for confirmation, whatever its risk.
    pub confirmation_mode: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_ACTION_TIMEOUT_SECS,
            max_observation_chars: DEFAULT_MAX_OBSERVATION_CHARS,
            confirmation_mode: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("no action awaiting confirmation with id {0}")]
    UnknownConfirmation(EventId),
    #[error("session {0} is closed")]
    Closed(SessionId),
}

/// What happened to a submitted action. Policy outcomes (limits, rejection,
/// a lost sandbox) are values here, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The action ran (or failed to) and its observation was appended.
    Observed {
        action_id: EventId,
        observation_id: EventId,
        observation: Observation,
    },
    /// Non-runnable actions are only recorded.
    Recorded { action_id: EventId },
    AwaitingConfirmation { action_id: EventId },
    Rejected {
        action_id: EventId,
        observation_id: EventId,
    },
    /// Nothing was appended. `stopped` is set when the session is over.
    LimitReached { error: FlagError, stopped: bool },
    /// The sandbox was lost; nothing runs until it is restarted.
    Disconnected,
    Stopped { reason: String },
}

#[derive(Debug)]
struct PendingAction {
    action: Action,
    timeout_secs: Option<u64>,
}

#[derive(Debug)]
struct ControllerState {
    iterations: IterationFlag,
    budget: Option<BudgetFlag>,
    /// Interactive sessions get one automatic limit raise.
    extended: bool,
    pending: IndexMap<EventId, PendingAction>,
    disconnected: bool,
    stopped: Option<String>,
}

/// Drives one session's actions through policy and the sandbox.
///
/// Two locks: `turn` is held for a whole submission so at most one action is
/// in flight, while `state` is only ever held for short, non-async sections.
/// Flag updates and queries therefore never wait on a running action.
pub struct SessionController {
    session_id: SessionId,
    stream: EventStream,
    sandboxes: Arc<LifecycleManager>,
    analyzer: Option<Arc<dyn SecurityAnalyzer>>,
    limits: LimitSettings,
    execution: ExecutionSettings,
    turn: Mutex<()>,
    state: parking_lot::Mutex<ControllerState>,
    in_flight: parking_lot::Mutex<Option<CancellationToken>>,
    /// Parent of every action's token; cancelled on close.
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("session_id", &self.session_id)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SessionController {
    pub fn new(
        stream: EventStream,
        sandboxes: Arc<LifecycleManager>,
        limits: LimitSettings,
        execution: ExecutionSettings,
    ) -> Self {
        let state = ControllerState {
            iterations: IterationFlag::new(
                "iterations",
                0,
                limits.max_iterations,
                limits.iteration_increase,
            ),
            budget: limits
                .max_budget
                .map(|max| BudgetFlag::new("budget", 0.0, max, limits.budget_increase)),
            extended: false,
            pending: IndexMap::new(),
            disconnected: false,
            stopped: None,
        };
        Self {
            session_id: stream.session_id().clone(),
            stream,
            sandboxes,
            analyzer: None,
            limits,
            execution,
            turn: Mutex::new(()),
            state: parking_lot::Mutex::new(state),
            in_flight: parking_lot::Mutex::new(None),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn SecurityAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    pub async fn submit(&self, action: Action) -> Result<StepOutcome, ControllerError> {
        self.submit_with_timeout(action, None).await
    }

    /// Append an agent action and carry it as far as policy allows.
    #[instrument(skip_all, fields(session_id = %self.session_id, action = action.kind.name()))]
    pub async fn submit_with_timeout(
        &self,
        mut action: Action,
        timeout_secs: Option<u64>,
    ) -> Result<StepOutcome, ControllerError> {
        self.ensure_open()?;
        let _turn = self.turn.lock().await;
        // Closed while we waited for the previous action.
        self.ensure_open()?;

        {
            let mut state = self.state.lock();
            if let Some(reason) = &state.stopped {
                return Ok(StepOutcome::Stopped {
                    reason: reason.clone(),
                });
            }
            if action.runnable() {
                if state.disconnected {
                    return Ok(StepOutcome::Disconnected);
                }
                if let Some(outcome) = self.gate(&mut state) {
                    return Ok(outcome);
                }
            }
        }

        if action.runnable() {
            if let Some(analyzer) = &self.analyzer {
                action.security_risk = analyzer.risk(&action).await;
            }
            let needs_confirmation =
                action.security_risk == SecurityRisk::High || self.execution.confirmation_mode;
            if needs_confirmation && action.confirmation_status == ConfirmationStatus::Confirmed {
                action.confirmation_status = ConfirmationStatus::AwaitingConfirmation;
            }
        }

        let mut draft = EventDraft::action(action.clone());
        if let Some(timeout) = timeout_secs {
            draft = draft.with_timeout(timeout);
        }
        let action_id = self.stream.append(draft, EventSource::Agent).await?;

        if !action.runnable() {
            return Ok(StepOutcome::Recorded { action_id });
        }
        match action.confirmation_status {
            ConfirmationStatus::AwaitingConfirmation => {
                info!(%action_id, risk = ?action.security_risk, "action awaiting confirmation");
                self.state.lock().pending.insert(
                    action_id,
                    PendingAction {
                        action,
                        timeout_secs,
                    },
                );
                Ok(StepOutcome::AwaitingConfirmation { action_id })
            }
            ConfirmationStatus::Rejected => {
                let observation_id = self.append_rejection(action_id).await?;
                Ok(StepOutcome::Rejected {
                    action_id,
                    observation_id,
                })
            }
            ConfirmationStatus::Confirmed => self.run(action_id, action, timeout_secs).await,
        }
    }

    /// Confirm or reject a pending action. The decision is appended as a new
    /// user action caused by the pending one; only a confirmed action runs.
    ///
    /// A stopped session rejects the pending action and reports `Stopped`.
    /// Approving while the sandbox is lost leaves it pending and reports
    /// `Disconnected`, so it can be approved again after a restart.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn resolve_confirmation(
        &self,
        action_id: EventId,
        approve: bool,
    ) -> Result<StepOutcome, ControllerError> {
        self.ensure_open()?;
        let _turn = self.turn.lock().await;
        self.ensure_open()?;

        let (pending, stopped) = {
            let mut state = self.state.lock();
            if !state.pending.contains_key(&action_id) {
                return Err(ControllerError::UnknownConfirmation(action_id));
            }
            if approve && state.stopped.is_none() && state.disconnected {
                return Ok(StepOutcome::Disconnected);
            }
            let stopped = state.stopped.clone();
            let pending = state
                .pending
                .shift_remove(&action_id)
                .ok_or(ControllerError::UnknownConfirmation(action_id))?;
            (pending, stopped)
        };

        if let Some(reason) = stopped {
            warn!(pending = %action_id, %reason, "session stopped, rejecting pending action");
            self.append_rejection(action_id).await?;
            return Ok(StepOutcome::Stopped { reason });
        }

        let status = if approve {
            ConfirmationStatus::Confirmed
        } else {
            ConfirmationStatus::Rejected
        };
        let action = pending.action.with_status(status);
        let mut draft = EventDraft::action(action.clone()).caused_by(action_id);
        if let Some(timeout) = pending.timeout_secs {
            draft = draft.with_timeout(timeout);
        }
        let resolved_id = self.stream.append(draft, EventSource::User).await?;
        info!(pending = %action_id, resolved = %resolved_id, approve, "confirmation resolved");

        if approve {
            self.run(resolved_id, action, pending.timeout_secs).await
        } else {
            let observation_id = self.append_rejection(resolved_id).await?;
            Ok(StepOutcome::Rejected {
                action_id: resolved_id,
                observation_id,
            })
        }
    }

    pub async fn pending_confirmations(&self) -> Vec<EventId> {
        self.state.lock().pending.keys().copied().collect()
    }

    /// Accrue cost against the budget flag, if one is configured.
    pub async fn record_spend(&self, amount: f64) {
        if let Some(budget) = self.state.lock().budget.as_mut() {
            budget.record(amount);
            debug!(session_id = %self.session_id, spent = budget.current_value, "spend recorded");
        }
    }

    /// Raise every flag by its configured increase.
    pub async fn extend_limits(&self) {
        let mut state = self.state.lock();
        state.iterations.increase_by_default();
        if let Some(budget) = state.budget.as_mut() {
            budget.increase_by_default();
        }
    }

    pub async fn iterations(&self) -> IterationFlag {
        self.state.lock().iterations.clone()
    }

    /// Whether an action is executing right now.
    pub fn is_busy(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Cancel the action currently executing, if any.
    pub fn cancel(&self) -> bool {
        match self.in_flight.lock().as_ref() {
            Some(token) => {
                info!(session_id = %self.session_id, "cancelling in-flight action");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Replace a lost sandbox. Waits for any in-flight action first.
    pub async fn restart_sandbox(&self) -> SandboxResult<SandboxHandle> {
        let _turn = self.turn.lock().await;
        let handle = self.sandboxes.restart(&self.session_id).await?;
        self.state.lock().disconnected = false;
        Ok(handle)
    }

    /// Refuse further work and cancel whatever is running.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
        self.cancel();
    }

    /// Wait for the in-flight action to record its observation, then reject
    /// every action still awaiting confirmation. After [`close`](Self::close)
    /// and `drain`, every action in the log has an outcome.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn drain(&self) -> Result<(), ControllerError> {
        let _turn = self.turn.lock().await;
        let pending: Vec<EventId> = self.state.lock().pending.drain(..).map(|(id, _)| id).collect();
        for action_id in pending {
            debug!(pending = %action_id, "rejecting unresolved action on close");
            self.append_rejection(action_id).await?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), ControllerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ControllerError::Closed(self.session_id.clone()));
        }
        Ok(())
    }

    fn gate(&self, state: &mut ControllerState) -> Option<StepOutcome> {
        let Err(error) = check_flags(state) else {
            return None;
        };
        if !self.limits.headless && !state.extended {
            state.extended = true;
            if state.iterations.reached_limit() {
                state.iterations.increase_by_default();
            }
            if let Some(budget) = state.budget.as_mut().filter(|b| b.reached_limit()) {
                budget.increase_by_default();
            }
            info!(session_id = %self.session_id, %error, "limit raised once for interactive session");
            if check_flags(state).is_ok() {
                return None;
            }
        }
        let stopped = self.limits.headless;
        if stopped {
            state.stopped = Some(error.to_string());
        }
        warn!(session_id = %self.session_id, %error, stopped, "control flag limit reached");
        Some(StepOutcome::LimitReached { error, stopped })
    }

    /// Callers hold `turn`.
    async fn run(
        &self,
        action_id: EventId,
        action: Action,
        timeout_secs: Option<u64>,
    ) -> Result<StepOutcome, ControllerError> {
        let timeout = timeout_secs.unwrap_or(self.execution.default_timeout_secs);
        let observation = match self.sandboxes.acquire(&self.session_id).await {
            Err(error) => {
                warn!(session_id = %self.session_id, %error, "sandbox unavailable");
                Observation::new(
                    ObservationKind::Error {
                        error_kind: error.cause.kind(),
                    },
                    error.to_string(),
                )
            }
            Ok(_) => {
                let cancel = self.shutdown.child_token();
                *self.in_flight.lock() = Some(cancel.clone());
                let result = self
                    .sandboxes
                    .execute(&self.session_id, ExecuteRequest::new(action, timeout), cancel)
                    .await;
                *self.in_flight.lock() = None;
                match result {
                    Ok(observation) => observation,
                    Err(error) => {
                        if matches!(error, ExecutionError::Disconnected(_)) {
                            self.state.lock().disconnected = true;
                        }
                        debug!(session_id = %self.session_id, %error, "execution failed");
                        Observation::from_error(&error)
                    }
                }
            }
        }
        .truncated(self.execution.max_observation_chars);

        let observation_id = self
            .stream
            .append(
                EventDraft::observation(observation.clone(), action_id),
                EventSource::Environment,
            )
            .await?;
        Ok(StepOutcome::Observed {
            action_id,
            observation_id,
            observation,
        })
    }

    async fn append_rejection(&self, action_id: EventId) -> Result<EventId, ControllerError> {
        let id = self
            .stream
            .append(
                EventDraft::observation(Observation::rejected(), action_id),
                EventSource::Environment,
            )
            .await?;
        Ok(id)
    }
}

fn check_flags(state: &mut ControllerState) -> Result<(), FlagError> {
    if let Some(budget) = state.budget.as_mut() {
        budget.step()?;
    }
    state.iterations.step()
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use async_trait::async_trait;
    use stagehand_events::{InMemoryPageStore, SearchQuery, StreamConfig};
    use stagehand_exec::{ActionExecutor, BackoffPolicy};
    use stagehand_protocol::{EventPayload, ExecutionErrorKind, ExecutionResult};
    use stagehand_sandbox::{
        BackendKind, CleanupFailure, DirectBackend, DirectSettings, Endpoint, ProvisionRequest,
        SandboxBackend, SandboxInstance, SandboxState, TeardownMode,
    };

    use super::*;
    use crate::analyzer::PatternAnalyzer;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    async fn stream(session: &str) -> Result<EventStream> {
        Ok(EventStream::open(
            session.into(),
            Arc::new(InMemoryPageStore::new()),
            StreamConfig::default(),
        )
        .await?)
    }

    async fn direct_controller(name: &str, limits: LimitSettings) -> Result<(SessionController, PathBuf)> {
        let root = unique_test_root(name);
        let sandboxes = Arc::new(LifecycleManager::new(Arc::new(DirectBackend::new(
            DirectSettings {
                base_dir: root.clone(),
                ..DirectSettings::default()
            },
        ))));
        let controller = SessionController::new(
            stream(name).await?,
            sandboxes,
            limits,
            ExecutionSettings::default(),
        );
        Ok((controller, root))
    }

    fn observed(outcome: StepOutcome) -> (EventId, EventId, Observation) {
        match outcome {
            StepOutcome::Observed {
                action_id,
                observation_id,
                observation,
            } => (action_id, observation_id, observation),
            other => panic!("expected an observation, got {other:?}"),
        }
    }

    fn interactive(max_iterations: u64, increase: u64) -> LimitSettings {
        LimitSettings {
            max_iterations,
            iteration_increase: increase,
            headless: false,
            ..LimitSettings::default()
        }
    }

    #[tokio::test]
    async fn actions_produce_caused_observations() -> Result<()> {
        let (controller, root) = direct_controller("ctl-basic", LimitSettings::default()).await?;
        let (action_id, observation_id, observation) =
            observed(controller.submit(Action::cmd("echo observed")).await?);
        assert_eq!(observation.content.trim(), "observed");
        assert!(action_id < observation_id);

        let recorded = controller.submit(Action::message("done")).await?;
        assert!(matches!(recorded, StepOutcome::Recorded { .. }));

        let events = controller.stream().search_collect(SearchQuery::all()).await?;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].source, EventSource::Agent);
        assert_eq!(events[1].source, EventSource::Environment);
        assert_eq!(events[1].cause, Some(action_id));
        // Messages do not count against the iteration limit.
        assert_eq!(controller.iterations().await.current_value, 1);
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn high_risk_actions_wait_for_confirmation() -> Result<()> {
        let (controller, root) = direct_controller("ctl-confirm", LimitSettings::default()).await?;
        let controller = controller.with_analyzer(Arc::new(
            PatternAnalyzer::default().with_rule("touch *", SecurityRisk::High),
        ));

        let StepOutcome::AwaitingConfirmation { action_id } =
            controller.submit(Action::cmd("touch approved.txt")).await?
        else {
            panic!("expected confirmation");
        };
        assert_eq!(controller.pending_confirmations().await, vec![action_id]);
        let workspace = root.join(SessionId::from("ctl-confirm").slug());
        assert!(!workspace.join("approved.txt").exists());

        let outcome = controller.resolve_confirmation(action_id, true).await?;
        assert!(matches!(outcome, StepOutcome::Observed { .. }));
        assert!(workspace.join("approved.txt").exists());
        assert!(matches!(
            controller.resolve_confirmation(action_id, true).await,
            Err(ControllerError::UnknownConfirmation(_))
        ));

        let StepOutcome::AwaitingConfirmation { action_id } =
            controller.submit(Action::cmd("touch rejected.txt")).await?
        else {
            panic!("expected confirmation");
        };
        let StepOutcome::Rejected {
            action_id: resolved,
            observation_id,
        } = controller.resolve_confirmation(action_id, false).await?
        else {
            panic!("expected rejection");
        };
        assert!(!workspace.join("rejected.txt").exists());

        let decision = controller.stream().get(resolved).await?;
        assert_eq!(decision.source, EventSource::User);
        assert_eq!(decision.cause, Some(action_id));
        assert_eq!(
            decision.action().map(|a| a.confirmation_status),
            Some(ConfirmationStatus::Rejected)
        );
        let observation = controller.stream().get(observation_id).await?;
        assert!(matches!(
            observation.payload,
            EventPayload::Observation(Observation {
                kind: ObservationKind::Rejected,
                ..
            })
        ));
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn pre_rejected_actions_never_run() -> Result<()> {
        let (controller, root) = direct_controller("ctl-prerejected", LimitSettings::default()).await?;
        let action = Action::cmd("touch never.txt").with_status(ConfirmationStatus::Rejected);
        assert!(matches!(
            controller.submit(action).await?,
            StepOutcome::Rejected { .. }
        ));
        assert!(!root.join(SessionId::from("ctl-prerejected").slug()).join("never.txt").exists());
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn headless_limit_stops_the_session() -> Result<()> {
        let limits = LimitSettings {
            max_iterations: 2,
            ..LimitSettings::default()
        };
        let (controller, root) = direct_controller("ctl-headless", limits).await?;
        controller.submit(Action::cmd("true")).await?;
        controller.submit(Action::cmd("true")).await?;
        let outcome = controller.submit(Action::cmd("true")).await?;
        assert!(matches!(outcome, StepOutcome::LimitReached { stopped: true, .. }));
        assert!(matches!(
            controller.submit(Action::message("still there?")).await?,
            StepOutcome::Stopped { .. }
        ));
        // The refused action was never appended.
        assert_eq!(controller.stream().latest_id(), Some(EventId(3)));
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn interactive_sessions_get_one_automatic_raise() -> Result<()> {
        let (controller, root) = direct_controller("ctl-interactive", interactive(1, 1)).await?;
        assert!(matches!(controller.submit(Action::cmd("true")).await?, StepOutcome::Observed { .. }));
        assert!(matches!(controller.submit(Action::cmd("true")).await?, StepOutcome::Observed { .. }));
        let outcome = controller.submit(Action::cmd("true")).await?;
        assert!(matches!(outcome, StepOutcome::LimitReached { stopped: false, .. }));

        controller.extend_limits().await;
        assert!(matches!(controller.submit(Action::cmd("true")).await?, StepOutcome::Observed { .. }));
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn budget_gate_uses_recorded_spend() -> Result<()> {
        let limits = LimitSettings {
            max_budget: Some(1.0),
            ..LimitSettings::default()
        };
        let (controller, root) = direct_controller("ctl-budget", limits).await?;
        controller.submit(Action::cmd("true")).await?;
        controller.record_spend(1.5).await;
        let StepOutcome::LimitReached { error, stopped } =
            controller.submit(Action::cmd("true")).await?
        else {
            panic!("expected the budget gate");
        };
        assert!(stopped);
        assert!(error.to_string().starts_with("budget"));
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn back_to_back_actions_run_sequentially() -> Result<()> {
        let (controller, root) = direct_controller("ctl-sequential", LimitSettings::default()).await?;
        let controller = Arc::new(controller);
        let tasks: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|tag| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    controller
                        .submit(Action::cmd(format!(
                            "echo start-{tag} >> log.txt; sleep 0.2; echo end-{tag} >> log.txt"
                        )))
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(matches!(task.await??, StepOutcome::Observed { .. }));
        }

        let log = std::fs::read_to_string(
            root.join(SessionId::from("ctl-sequential").slug()).join("log.txt"),
        )?;
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 6);
        for pair in lines.chunks(2) {
            let tag = pair[0].trim_start_matches("start-");
            assert_eq!(pair[1], format!("end-{tag}"), "interleaved log: {lines:?}");
        }
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_interrupts_the_running_action() -> Result<()> {
        let (controller, root) = direct_controller("ctl-cancel", LimitSettings::default()).await?;
        let controller = Arc::new(controller);
        let started = Instant::now();
        let task = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.submit(Action::cmd("sleep 30")).await })
        };
        while !controller.cancel() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (_, _, observation) = observed(task.await??);
        assert!(observation.is_error());
        assert!(observation.content.contains("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(10));
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    /// Sandbox whose connection drops on every execute.
    struct FlakyBackend {
        provisions: AtomicUsize,
    }

    struct FlakyInstance;

    #[async_trait]
    impl ActionExecutor for FlakyInstance {
        async fn execute(
            &self,
            _request: ExecuteRequest,
            _cancel: CancellationToken,
        ) -> ExecutionResult<Observation> {
            Err(ExecutionError::Disconnected("connection reset".into()))
        }

        async fn alive(&self) -> ExecutionResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SandboxInstance for FlakyInstance {
        fn endpoint(&self) -> Endpoint {
            Endpoint::InProcess
        }

        fn workspace(&self) -> &Path {
            Path::new("/flaky")
        }

        fn executor(&self) -> Arc<dyn ActionExecutor> {
            Arc::new(FlakyInstance)
        }

        async fn probe(&self) -> ExecutionResult<()> {
            Ok(())
        }

        async fn teardown(&self, _mode: TeardownMode) -> Vec<CleanupFailure> {
            Vec::new()
        }
    }

    #[async_trait]
    impl SandboxBackend for FlakyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        fn readiness(&self) -> &BackoffPolicy {
            static POLICY: BackoffPolicy = BackoffPolicy {
                initial_delay_ms: 1,
                multiplier: 1.0,
                max_delay_ms: 1,
                max_attempts: 1,
                deadline_secs: 1,
            };
            &POLICY
        }

        async fn provision(&self, _request: &ProvisionRequest) -> ExecutionResult<Box<dyn SandboxInstance>> {
            self.provisions.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Box::new(FlakyInstance))
        }
    }

    #[tokio::test]
    async fn disconnect_blocks_until_restart() -> Result<()> {
        let backend = Arc::new(FlakyBackend {
            provisions: AtomicUsize::new(0),
        });
        let sandboxes = Arc::new(LifecycleManager::new(backend.clone()));
        let controller = SessionController::new(
            stream("ctl-flaky").await?,
            Arc::clone(&sandboxes),
            LimitSettings::default(),
            ExecutionSettings::default(),
        );

        let (_, _, observation) = observed(controller.submit(Action::cmd("ls")).await?);
        assert_eq!(
            observation.kind,
            ObservationKind::Error {
                error_kind: ExecutionErrorKind::Disconnected
            }
        );
        assert_eq!(
            sandboxes.state(controller.session_id()).status_code(),
            "ERROR_DISCONNECTED"
        );
        assert_eq!(controller.submit(Action::cmd("ls")).await?, StepOutcome::Disconnected);

        let handle = controller.restart_sandbox().await?;
        assert_eq!(handle.state, SandboxState::Ready);
        assert_eq!(backend.provisions.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(matches!(
            controller.submit(Action::cmd("ls")).await?,
            StepOutcome::Observed { .. }
        ));
        Ok(())
    }

    async fn wait_until_busy(controller: &SessionController) {
        while !controller.is_busy() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn flags_stay_responsive_while_an_action_runs() -> Result<()> {
        let limits = LimitSettings {
            max_budget: Some(10.0),
            ..LimitSettings::default()
        };
        let (controller, root) = direct_controller("ctl-responsive", limits).await?;
        let controller = Arc::new(controller);
        let task = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.submit(Action::cmd("sleep 2")).await })
        };
        wait_until_busy(&controller).await;

        let quick = Duration::from_millis(500);
        tokio::time::timeout(quick, controller.record_spend(1.0)).await?;
        tokio::time::timeout(quick, controller.extend_limits()).await?;
        let pending = tokio::time::timeout(quick, controller.pending_confirmations()).await?;
        assert!(pending.is_empty());
        let iterations = tokio::time::timeout(quick, controller.iterations()).await?;
        assert_eq!(iterations.limit, 150);
        assert!(controller.is_busy());

        assert!(matches!(task.await??, StepOutcome::Observed { .. }));
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn stopped_sessions_reject_pending_confirmations() -> Result<()> {
        let limits = LimitSettings {
            max_iterations: 1,
            ..LimitSettings::default()
        };
        let (controller, root) = direct_controller("ctl-stopped-confirm", limits).await?;
        let controller = controller.with_analyzer(Arc::new(
            PatternAnalyzer::default().with_rule("touch *", SecurityRisk::High),
        ));

        let StepOutcome::AwaitingConfirmation { action_id } =
            controller.submit(Action::cmd("touch late.txt")).await?
        else {
            panic!("expected confirmation");
        };
        assert!(matches!(
            controller.submit(Action::cmd("true")).await?,
            StepOutcome::LimitReached { stopped: true, .. }
        ));

        let outcome = controller.resolve_confirmation(action_id, true).await?;
        assert!(matches!(outcome, StepOutcome::Stopped { .. }));
        assert!(controller.pending_confirmations().await.is_empty());
        let workspace = root.join(SessionId::from("ctl-stopped-confirm").slug());
        assert!(!workspace.join("late.txt").exists());

        let events = controller.stream().search_collect(SearchQuery::all()).await?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].cause, Some(action_id));
        assert!(matches!(
            events[1].observation().map(|o| &o.kind),
            Some(ObservationKind::Rejected)
        ));
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn approvals_wait_for_a_lost_sandbox_to_be_restarted() -> Result<()> {
        let backend = Arc::new(FlakyBackend {
            provisions: AtomicUsize::new(0),
        });
        let controller = SessionController::new(
            stream("ctl-flaky-confirm").await?,
            Arc::new(LifecycleManager::new(backend)),
            LimitSettings::default(),
            ExecutionSettings {
                confirmation_mode: true,
                ..ExecutionSettings::default()
            },
        );

        let StepOutcome::AwaitingConfirmation { action_id: first } =
            controller.submit(Action::cmd("ls")).await?
        else {
            panic!("expected confirmation");
        };
        let StepOutcome::AwaitingConfirmation { action_id: second } =
            controller.submit(Action::cmd("pwd")).await?
        else {
            panic!("expected confirmation");
        };
        observed(controller.resolve_confirmation(first, true).await?);
        let logged = controller.stream().latest_id();

        assert_eq!(
            controller.resolve_confirmation(second, true).await?,
            StepOutcome::Disconnected
        );
        assert_eq!(controller.pending_confirmations().await, vec![second]);
        assert_eq!(controller.stream().latest_id(), logged);

        // Rejecting needs no sandbox.
        assert!(matches!(
            controller.resolve_confirmation(second, false).await?,
            StepOutcome::Rejected { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn drain_waits_for_the_cancelled_action_to_be_observed() -> Result<()> {
        let (controller, root) = direct_controller("ctl-drain", LimitSettings::default()).await?;
        let controller = Arc::new(controller.with_analyzer(Arc::new(
            PatternAnalyzer::default().with_rule("touch *", SecurityRisk::High),
        )));
        let StepOutcome::AwaitingConfirmation { action_id: held } =
            controller.submit(Action::cmd("touch held.txt")).await?
        else {
            panic!("expected confirmation");
        };

        let started = Instant::now();
        let task = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.submit(Action::cmd("sleep 30")).await })
        };
        wait_until_busy(&controller).await;
        controller.close();
        controller.drain().await?;

        let (action_id, _, observation) = observed(task.await??);
        assert!(observation.is_error());
        assert!(started.elapsed() < Duration::from_secs(10));

        let events = controller.stream().search_collect(SearchQuery::all()).await?;
        let observed_causes: Vec<_> = events.iter().filter_map(|e| e.cause).collect();
        assert!(observed_causes.contains(&held));
        assert!(observed_causes.contains(&action_id));
        assert!(controller.pending_confirmations().await.is_empty());
        assert!(matches!(
            controller.submit(Action::cmd("true")).await,
            Err(ControllerError::Closed(_))
        ));
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn closed_controllers_refuse_work() -> Result<()> {
        let (controller, root) = direct_controller("ctl-closed", LimitSettings::default()).await?;
        controller.close();
        assert!(matches!(
            controller.submit(Action::cmd("true")).await,
            Err(ControllerError::Closed(_))
        ));
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }
}
