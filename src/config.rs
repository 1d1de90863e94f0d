//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service name used for stored credentials.
const KEYRING_SERVICE: &str = "phoenix-engine";

/// Checkpoint policy settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    /// Minimum seconds between automatic checkpoints of one session.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Checkpoint immediately once planning completes.
    #[serde(default = "default_true")]
    pub on_plan_complete: bool,
    /// Consecutive failed checkpoints before logging escalates to `error`.
    #[serde(default = "default_failure_escalation_threshold")]
    pub failure_escalation_threshold: u32,
    /// Default page size for checkpoint listings.
    #[serde(default = "default_list_limit")]
    pub list_limit: u32,
    /// How long a manual checkpoint waits for a running session's next
    /// step boundary.
    #[serde(default = "default_manual_timeout_seconds")]
    pub manual_timeout_seconds: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            on_plan_complete: true,
            failure_escalation_threshold: default_failure_escalation_threshold(),
            list_limit: default_list_limit(),
            manual_timeout_seconds: default_manual_timeout_seconds(),
        }
    }
}

impl CheckpointConfig {
    /// Minimum interval as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Manual checkpoint wait as a [`Duration`].
    #[must_use]
    pub fn manual_timeout(&self) -> Duration {
        Duration::from_secs(self.manual_timeout_seconds)
    }
}

fn default_interval_seconds() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_failure_escalation_threshold() -> u32 {
    3
}

fn default_list_limit() -> u32 {
    10
}

fn default_manual_timeout_seconds() -> u64 {
    30
}

/// Which snapshot backend implementation to construct.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotBackendKind {
    /// In-process logging backend; no real process freeze.
    #[default]
    Simulated,
    /// Remote memory-checkpoint service reached over HTTP.
    Http,
}

/// Snapshot backend settings.
///
/// The API key is loaded at runtime via OS keychain or environment
/// variable, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SnapshotConfig {
    /// Backend implementation.
    #[serde(default)]
    pub backend: SnapshotBackendKind,
    /// Prefix used to derive a container identifier per session.
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    /// Base URL of the checkpoint service (required for `http`).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Project identifier forwarded to the checkpoint service.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Request timeout for backend calls.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Bearer token for the checkpoint service (populated at runtime).
    #[serde(skip)]
    pub api_key: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            backend: SnapshotBackendKind::Simulated,
            container_prefix: default_container_prefix(),
            endpoint: None,
            project_id: None,
            timeout_seconds: default_timeout_seconds(),
            api_key: String::new(),
        }
    }
}

impl SnapshotConfig {
    /// Container identifier the backend freezes for a given session.
    #[must_use]
    pub fn container_id(&self, session_id: &str) -> String {
        format!("{}-{session_id}", self.container_prefix)
    }
}

fn default_container_prefix() -> String {
    "phoenix-agent".into()
}

fn default_timeout_seconds() -> u64 {
    10
}

/// Settings for the built-in scripted collaborator.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct CollaboratorConfig {
    /// Artificial latency per executed step, in milliseconds.
    #[serde(default)]
    pub step_delay_ms: u64,
    /// Steps planned when the task text carries no numbered list.
    #[serde(default)]
    pub default_plan: Vec<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("phoenix.db")
}

fn default_http_port() -> u16 {
    8787
}

fn default_retention_days() -> u32 {
    30
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` file backing the checkpoint store.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// HTTP port for the API surface.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Days before checkpoints are purged; 0 disables retention.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Checkpoint policy.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Snapshot backend settings.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Scripted collaborator settings.
    #[serde(default)]
    pub collaborator: CollaboratorConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            http_port: default_http_port(),
            retention_days: default_retention_days(),
            checkpoint: CheckpointConfig::default(),
            snapshot: SnapshotConfig::default(),
            collaborator: CollaboratorConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the snapshot service API key from OS keychain with env-var fallback.
    ///
    /// Only the `http` backend needs a key; for the simulated backend this
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the `http` backend is selected and
    /// neither keychain nor env var provides the key.
    pub async fn load_credentials(&mut self) -> Result<()> {
        if self.snapshot.backend == SnapshotBackendKind::Http {
            self.snapshot.api_key =
                load_credential("snapshot_api_key", "PHOENIX_SNAPSHOT_API_KEY").await?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.checkpoint.failure_escalation_threshold == 0 {
            return Err(AppError::Config(
                "checkpoint.failure_escalation_threshold must be greater than zero".into(),
            ));
        }

        if self.checkpoint.list_limit == 0 {
            return Err(AppError::Config(
                "checkpoint.list_limit must be greater than zero".into(),
            ));
        }

        if self.checkpoint.manual_timeout_seconds == 0 {
            return Err(AppError::Config(
                "checkpoint.manual_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.snapshot.container_prefix.trim().is_empty() {
            return Err(AppError::Config(
                "snapshot.container_prefix must not be empty".into(),
            ));
        }

        if self.snapshot.backend == SnapshotBackendKind::Http
            && self
                .snapshot
                .endpoint
                .as_deref()
                .is_none_or(|e| e.trim().is_empty())
        {
            return Err(AppError::Config(
                "snapshot.endpoint is required for the http backend".into(),
            ));
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
