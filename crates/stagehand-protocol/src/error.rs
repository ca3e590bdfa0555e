//! Execution error taxonomy shared by every backend and the client.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors an `execute` (or a liveness check) can end with.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("sandbox disconnected: {0}")]
    Disconnected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timed out after {after_secs}s")]
    Timeout { after_secs: u64 },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("sandbox error: {message}")]
    Sandbox {
        message: String,
        #[source]
        cause: Option<BoxError>,
    },
}

impl ExecutionError {
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox {
            message: message.into(),
            cause: None,
        }
    }

    pub fn sandbox_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Sandbox {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            ExecutionError::Disconnected(_) => ExecutionErrorKind::Disconnected,
            ExecutionError::NotFound(_) => ExecutionErrorKind::NotFound,
            ExecutionError::Timeout { .. } => ExecutionErrorKind::Timeout,
            ExecutionError::PermissionDenied(_) => ExecutionErrorKind::PermissionDenied,
            ExecutionError::Sandbox { .. } => ExecutionErrorKind::Sandbox,
        }
    }

    /// Transient failures may be retried by idempotent callers (liveness,
    /// handshake). `execute` never retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecutionError::Disconnected(_) | ExecutionError::Timeout { .. }
        )
    }

    /// Flatten into the wire representation.
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            ExecutionError::Disconnected(m)
            | ExecutionError::NotFound(m)
            | ExecutionError::PermissionDenied(m) => m.clone(),
            ExecutionError::Timeout { after_secs } => after_secs.to_string(),
            ExecutionError::Sandbox { message, cause } => match cause {
                Some(cause) => format!("{message}: {cause}"),
                None => message.clone(),
            },
        };
        ErrorBody {
            kind: self.kind(),
            message,
        }
    }

    pub fn from_body(body: ErrorBody) -> Self {
        match body.kind {
            ExecutionErrorKind::Disconnected => ExecutionError::Disconnected(body.message),
            ExecutionErrorKind::NotFound => ExecutionError::NotFound(body.message),
            ExecutionErrorKind::Timeout => ExecutionError::Timeout {
                after_secs: body.message.parse().unwrap_or_default(),
            },
            ExecutionErrorKind::PermissionDenied => ExecutionError::PermissionDenied(body.message),
            ExecutionErrorKind::Sandbox => ExecutionError::sandbox(body.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Disconnected,
    NotFound,
    Timeout,
    PermissionDenied,
    Sandbox,
}

/// Error payload carried by the action-execution wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

/// Convenience result type for execution calls.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_roundtrip_preserves_kind() {
        let original = ExecutionError::PermissionDenied("/etc/passwd".into());
        let back = ExecutionError::from_body(original.to_body());
        assert_eq!(back.kind(), ExecutionErrorKind::PermissionDenied);
        assert_eq!(back.to_string(), "permission denied: /etc/passwd");

        let timeout = ExecutionError::from_body(ExecutionError::Timeout { after_secs: 9 }.to_body());
        assert!(matches!(timeout, ExecutionError::Timeout { after_secs: 9 }));
    }

    #[test]
    fn sandbox_error_keeps_cause() {
        let io = std::io::Error::other("quota exceeded");
        let error = ExecutionError::sandbox_with("provisioning failed", io);
        assert!(error.source().is_some());
        assert_eq!(error.to_body().message, "provisioning failed: quota exceeded");
    }

    #[test]
    fn only_backend_failures_are_transient() {
        assert!(ExecutionError::Disconnected("refused".into()).is_transient());
        assert!(ExecutionError::Timeout { after_secs: 1 }.is_transient());
        assert!(!ExecutionError::PermissionDenied("x".into()).is_transient());
        assert!(!ExecutionError::sandbox("boom").is_transient());
    }
}
