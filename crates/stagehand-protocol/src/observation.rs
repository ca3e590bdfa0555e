//! Observations: the result of executing an action.

use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, ExecutionErrorKind};

pub const DEFAULT_MAX_OBSERVATION_CHARS: usize = 30_000;

const TRUNCATION_MARKER: &str = "\n<response clipped>\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "observation", rename_all = "snake_case")]
pub enum ObservationKind {
    CmdOutput {
        command: String,
        exit_code: i32,
    },
    FileRead {
        path: String,
    },
    FileWrite {
        path: String,
    },
    FileEdit {
        path: String,
    },
    Browse {
        url: String,
        status: u16,
    },
    Error {
        error_kind: ExecutionErrorKind,
    },
    Timeout {
        timeout_secs: u64,
    },
    /// The action was rejected during confirmation and never executed.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(flatten)]
    pub kind: ObservationKind,
    pub content: String,
}

impl Observation {
    pub fn new(kind: ObservationKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    /// Turn an execution failure into the observation the loop will see.
    pub fn from_error(error: &ExecutionError) -> Self {
        match error {
            ExecutionError::Timeout { after_secs } => Self::new(
                ObservationKind::Timeout {
                    timeout_secs: *after_secs,
                },
                error.to_string(),
            ),
            other => Self::new(
                ObservationKind::Error {
                    error_kind: other.kind(),
                },
                other.to_string(),
            ),
        }
    }

    pub fn rejected() -> Self {
        Self::new(
            ObservationKind::Rejected,
            "action was rejected and not executed",
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.kind,
            ObservationKind::Error { .. } | ObservationKind::Timeout { .. }
        )
    }

    pub fn truncated(mut self, max_chars: usize) -> Self {
        self.content = truncate_content(&self.content, max_chars);
        self
    }
}

/// Clip `content` to roughly `max_chars` characters, keeping the head and the
/// tail around a marker.
pub fn truncate_content(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content.to_owned();
    }
    let half = max_chars / 2;
    let head: String = content.chars().take(half).collect();
    let tail: String = content.chars().skip(total - half).collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_is_untouched() {
        assert_eq!(truncate_content("hello", 10), "hello");
    }

    #[test]
    fn long_content_keeps_head_and_tail() {
        let content = format!("{}{}", "a".repeat(50), "b".repeat(50));
        let clipped = truncate_content(&content, 20);
        assert!(clipped.starts_with(&"a".repeat(10)));
        assert!(clipped.ends_with(&"b".repeat(10)));
        assert!(clipped.contains("<response clipped>"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let content = "é".repeat(30);
        let clipped = truncate_content(&content, 10);
        assert!(clipped.starts_with("ééééé"));
    }

    #[test]
    fn timeout_error_becomes_timeout_observation() {
        let observation = Observation::from_error(&ExecutionError::Timeout { after_secs: 5 });
        assert!(matches!(
            observation.kind,
            ObservationKind::Timeout { timeout_secs: 5 }
        ));
        assert!(observation.is_error());

        let denied = Observation::from_error(&ExecutionError::PermissionDenied("../etc".into()));
        assert!(matches!(
            denied.kind,
            ObservationKind::Error {
                error_kind: ExecutionErrorKind::PermissionDenied
            }
        ));
    }
}
