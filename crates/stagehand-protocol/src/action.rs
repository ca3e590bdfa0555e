//! Actions: operations an agent or user asks the platform to perform.

use serde::{Deserialize, Serialize};

/// Whether an action may proceed to execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    AwaitingConfirmation,
    #[default]
    Confirmed,
    Rejected,
}

/// Risk assigned by the security analyzer before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityRisk {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
}

/// The concrete operation carried by an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    /// Run a shell command in the sandbox workspace.
    CmdRun {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Read a text file, optionally a 1-based inclusive line range.
    FileRead {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_line: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_line: Option<usize>,
    },
    FileWrite {
        path: String,
        content: String,
    },
    /// Replace exactly one occurrence of `old_str` with `new_str`.
    FileEdit {
        path: String,
        old_str: String,
        new_str: String,
    },
    BrowseUrl {
        url: String,
    },
    Message {
        content: String,
    },
    Finish {
        summary: String,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::CmdRun { .. } => "cmd_run",
            ActionKind::FileRead { .. } => "file_read",
            ActionKind::FileWrite { .. } => "file_write",
            ActionKind::FileEdit { .. } => "file_edit",
            ActionKind::BrowseUrl { .. } => "browse_url",
            ActionKind::Message { .. } => "message",
            ActionKind::Finish { .. } => "finish",
        }
    }

    /// Runnable actions produce a side effect in the sandbox and exactly one
    /// observation. Messages and finish markers are only recorded.
    pub fn runnable(&self) -> bool {
        !matches!(self, ActionKind::Message { .. } | ActionKind::Finish { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default)]
    pub confirmation_status: ConfirmationStatus,
    #[serde(default)]
    pub security_risk: SecurityRisk,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            confirmation_status: ConfirmationStatus::Confirmed,
            security_risk: SecurityRisk::Unknown,
        }
    }

    pub fn cmd(command: impl Into<String>) -> Self {
        Self::new(ActionKind::CmdRun {
            command: command.into(),
            cwd: None,
        })
    }

    pub fn read(path: impl Into<String>) -> Self {
        Self::new(ActionKind::FileRead {
            path: path.into(),
            start_line: None,
            end_line: None,
        })
    }

    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(ActionKind::FileWrite {
            path: path.into(),
            content: content.into(),
        })
    }

    pub fn message(content: impl Into<String>) -> Self {
        Self::new(ActionKind::Message {
            content: content.into(),
        })
    }

    pub fn runnable(&self) -> bool {
        self.kind.runnable()
    }

    /// Only confirmed actions may reach a sandbox.
    pub fn executable(&self) -> bool {
        self.runnable() && self.confirmation_status == ConfirmationStatus::Confirmed
    }

    pub fn with_risk(mut self, risk: SecurityRisk) -> Self {
        self.security_risk = risk;
        self
    }

    pub fn with_status(mut self, status: ConfirmationStatus) -> Self {
        self.confirmation_status = status;
        self
    }
}
