//! Kernel configuration, loadable from TOML.
//!
//! Every section falls back to its defaults, so an empty file (or none at
//! all) yields a working Direct-backend setup.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use stagehand_events::StreamConfig;
use stagehand_exec::BackoffPolicy;
use stagehand_protocol::SecurityRisk;
use stagehand_runtime::{ExecutionSettings, LimitSettings};
use stagehand_sandbox::{BackendKind, ClusterSettings, DirectSettings, LocalSettings};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub store: StoreKind,
    /// Where file-backed pages live, one directory per session.
    pub root: PathBuf,
    pub page_size: usize,
    pub cache_pages: usize,
    /// Environment variables whose values are redacted from every event.
    pub secret_env: Vec<String>,
}

impl Default for StreamSection {
    fn default() -> Self {
        let stream = StreamConfig::default();
        Self {
            store: StoreKind::File,
            root: std::env::temp_dir().join("stagehand-events"),
            page_size: stream.page_size,
            cache_pages: stream.cache_pages,
            secret_env: Vec::new(),
        }
    }
}

impl StreamSection {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            page_size: self.page_size,
            cache_pages: self.cache_pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: BackendKind,
    pub direct: DirectSettings,
    pub local: LocalSettings,
    pub cluster: ClusterSettings,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Direct,
            direct: DirectSettings::default(),
            local: LocalSettings::default(),
            cluster: ClusterSettings::default(),
        }
    }
}

impl SandboxSection {
    pub fn readiness(&self) -> &BackoffPolicy {
        match self.backend {
            BackendKind::Direct => &self.direct.readiness,
            BackendKind::Local => &self.local.readiness,
            BackendKind::Cluster => &self.cluster.readiness,
        }
    }
}

/// Command patterns rated by the built-in analyzer. No analyzer runs when
/// the table is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub rules: IndexMap<String, SecurityRisk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub stream: StreamSection,
    pub sandbox: SandboxSection,
    pub limits: LimitSettings,
    pub execution: ExecutionSettings,
    pub security: SecuritySection,
}

impl KernelConfig {
    /// Read and validate a TOML file. A missing file is an error here;
    /// callers wanting defaults use [`KernelConfig::load_or_default`].
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.page_size == 0 {
            return Err(ConfigError::Invalid("stream.page_size must be at least 1".into()));
        }
        if self.limits.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_iterations must be at least 1".into(),
            ));
        }
        if let Some(budget) = self.limits.max_budget {
            if !(budget.is_finite() && budget > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "limits.max_budget must be a positive number, got {budget}"
                )));
            }
        }
        if self.execution.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "execution.default_timeout_secs must be at least 1".into(),
            ));
        }
        if self.execution.max_observation_chars == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_observation_chars must be at least 1".into(),
            ));
        }

        let readiness = self.sandbox.readiness();
        if readiness.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "sandbox readiness max_attempts must be at least 1".into(),
            ));
        }
        if readiness.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "sandbox readiness multiplier must be >= 1.0, got {}",
                readiness.multiplier
            )));
        }

        match self.sandbox.backend {
            BackendKind::Direct => {}
            BackendKind::Local => {
                if self.sandbox.local.command.trim().is_empty() {
                    return Err(ConfigError::Invalid("sandbox.local.command is empty".into()));
                }
            }
            BackendKind::Cluster => {
                let cluster = &self.sandbox.cluster;
                if cluster.namespace.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "sandbox.cluster.namespace is empty".into(),
                    ));
                }
                if cluster.image.trim().is_empty() {
                    return Err(ConfigError::Invalid("sandbox.cluster.image is empty".into()));
                }
                if cluster.protocol_port == cluster.tools_port {
                    return Err(ConfigError::Invalid(
                        "sandbox.cluster protocol_port and tools_port must differ".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Secret values resolved from `stream.secret_env`. Unset variables are
    /// skipped.
    pub fn resolve_secrets(&self) -> Vec<String> {
        self.stream
            .secret_env
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .filter(|value| !value.is_empty())
            .collect()
    }

    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}
