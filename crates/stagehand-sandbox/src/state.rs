use std::fmt;

use serde::{Deserialize, Serialize};
use stagehand_protocol::ExecutionErrorKind;

/// Where in the lifecycle a sandbox failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Provisioning,
    Execution,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::Provisioning => f.write_str("provisioning"),
            FailureStage::Execution => f.write_str("execution"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFailure {
    pub stage: FailureStage,
    pub kind: ExecutionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SandboxState {
    #[default]
    Uninitialized,
    Provisioning,
    Ready,
    Executing,
    Closing,
    Closed,
    Error(SandboxFailure),
}

impl SandboxState {
    /// Stable status string reported to callers and UIs.
    pub fn status_code(&self) -> &'static str {
        match self {
            SandboxState::Uninitialized => "STATUS_UNINITIALIZED",
            SandboxState::Provisioning => "STATUS_PROVISIONING",
            SandboxState::Ready => "STATUS_READY",
            SandboxState::Executing => "STATUS_EXECUTING",
            SandboxState::Closing => "STATUS_CLOSING",
            SandboxState::Closed => "STATUS_CLOSED",
            SandboxState::Error(failure) => match (failure.stage, failure.kind) {
                (FailureStage::Provisioning, _) => "ERROR_PROVISIONING",
                (FailureStage::Execution, ExecutionErrorKind::Disconnected) => "ERROR_DISCONNECTED",
                (FailureStage::Execution, ExecutionErrorKind::Timeout) => "ERROR_TIMEOUT",
                (FailureStage::Execution, _) => "ERROR_SANDBOX",
            },
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SandboxState::Ready)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SandboxState::Error(_))
    }

    /// Legal edges of the lifecycle graph.
    pub fn can_transition_to(&self, next: &SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, next),
            (Uninitialized | Closed, Provisioning)
                | (Provisioning, Ready)
                | (Ready, Executing)
                | (Executing, Ready)
                | (Provisioning | Ready | Executing, Error(_))
                | (Uninitialized | Provisioning | Ready | Executing | Error(_), Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_code())
    }
}
