use serde::{Deserialize, Serialize};
use stagehand_protocol::ExecutionError;
use thiserror::Error;

use crate::state::FailureStage;

/// A sandbox could not be brought up (or is unusable) for a session.
#[derive(Debug, Error)]
#[error("sandbox {stage} failed: {cause}")]
pub struct SandboxError {
    pub stage: FailureStage,
    #[source]
    pub cause: ExecutionError,
}

impl SandboxError {
    pub fn provisioning(cause: ExecutionError) -> Self {
        Self {
            stage: FailureStage::Provisioning,
            cause,
        }
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// One teardown step that did not succeed. Teardown keeps going past these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub step: String,
    pub message: String,
}

impl CleanupFailure {
    pub fn new(step: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            step: step.into(),
            message: error.to_string(),
        }
    }
}
