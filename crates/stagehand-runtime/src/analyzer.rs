use async_trait::async_trait;
use indexmap::IndexMap;
use stagehand_protocol::{Action, ActionKind, SecurityRisk};

/// Assesses an action before it may run. A `High` result routes the action
/// through confirmation instead of straight to the sandbox.
#[async_trait]
pub trait SecurityAnalyzer: Send + Sync {
    async fn risk(&self, action: &Action) -> SecurityRisk;
}

/// Rates commands by glob-like patterns (`*` suffix means prefix match).
/// The highest matching rating wins; unmatched commands are `Low`.
#[derive(Debug, Clone, Default)]
pub struct PatternAnalyzer {
    rules: IndexMap<String, SecurityRisk>,
}

impl PatternAnalyzer {
    pub fn new(rules: IndexMap<String, SecurityRisk>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, pattern: impl Into<String>, risk: SecurityRisk) -> Self {
        self.rules.insert(pattern.into(), risk);
        self
    }

    fn matches(pattern: &str, command: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => command.starts_with(prefix),
            None => pattern == command,
        }
    }

    fn rate_command(&self, command: &str) -> SecurityRisk {
        let command = command.trim();
        self.rules
            .iter()
            .filter(|(pattern, _)| Self::matches(pattern, command))
            .map(|(_, risk)| *risk)
            .max()
            .unwrap_or(SecurityRisk::Low)
    }
}

#[async_trait]
impl SecurityAnalyzer for PatternAnalyzer {
    async fn risk(&self, action: &Action) -> SecurityRisk {
        match &action.kind {
            ActionKind::CmdRun { command, .. } => self.rate_command(command),
            ActionKind::FileWrite { .. } | ActionKind::FileEdit { .. } => SecurityRisk::Low,
            ActionKind::FileRead { .. } | ActionKind::BrowseUrl { .. } => SecurityRisk::Low,
            ActionKind::Message { .. } | ActionKind::Finish { .. } => SecurityRisk::Unknown,
        }
    }
}
