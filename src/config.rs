//! Global configuration parsing, validation, persistence, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::exec::capture::CaptureMode;
use crate::{AppError, Result};

/// Keychain service name under which the relay token is stored.
pub const KEYRING_SERVICE: &str = "agent-relay";

/// Keychain entry holding the relay token.
const TOKEN_KEY: &str = "relay_token";

/// Environment variable consulted when the keychain has no token.
pub const TOKEN_ENV_VAR: &str = "AGENT_RELAY_TOKEN";

/// Settings for invoking the wrapped coding agent.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent binary name or path (resolved on `PATH`).
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Wall-clock limit per execution; 0 means no timeout.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Text appended to the agent's system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_system_prompt: Option<String>,
    /// Output capture strategy.
    #[serde(default)]
    pub capture: CaptureMode,
    /// Poll interval for the sink-file capture strategy.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Quiet period before the stall advisory fires (sink-file capture only).
    #[serde(default = "default_stall_seconds")]
    pub stall_seconds: u64,
    /// Verify the agent binary before each spawn.
    #[serde(default = "default_preflight")]
    pub preflight: bool,
    /// Time between the termination signal and a forced kill.
    #[serde(default = "default_grace_seconds")]
    pub termination_grace_seconds: u64,
}

fn default_binary() -> String {
    "claude".into()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_stall_seconds() -> u64 {
    30
}

fn default_preflight() -> bool {
    cfg!(windows)
}

fn default_grace_seconds() -> u64 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            timeout_seconds: 0,
            append_system_prompt: None,
            capture: CaptureMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            stall_seconds: default_stall_seconds(),
            preflight: default_preflight(),
            termination_grace_seconds: default_grace_seconds(),
        }
    }
}

impl AgentConfig {
    /// Configured execution timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }

    /// Sink-file poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Quiet period before the stall advisory.
    #[must_use]
    pub fn stall_period(&self) -> Duration {
        Duration::from_secs(self.stall_seconds)
    }

    /// Grace period after the termination signal.
    #[must_use]
    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_seconds)
    }
}

/// Transport timing settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConnectionConfig {
    /// Heartbeat period.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    /// First reconnect delay.
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_seconds: u64,
    /// Reconnect delay ceiling.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_seconds: u64,
    /// Limit for one connect attempt, handshake included.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

fn default_heartbeat_seconds() -> u64 {
    30
}

fn default_reconnect_base() -> u64 {
    5
}

fn default_reconnect_max() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    20
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: default_heartbeat_seconds(),
            reconnect_base_seconds: default_reconnect_base(),
            reconnect_max_seconds: default_reconnect_max(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl ConnectionConfig {
    /// Heartbeat period.
    #[must_use]
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }

    /// First reconnect delay.
    #[must_use]
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_seconds)
    }

    /// Reconnect delay ceiling.
    #[must_use]
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_seconds)
    }

    /// Limit for one connect attempt.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Stable identity of this relay agent; generated on first start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// WebSocket endpoint of the remote controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Working directory used when a command does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_working_directory: Option<PathBuf>,
    /// Tools allowed when a command does not name any.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Agent invocation settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Transport timing settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
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

    /// Working directory for a command, falling back to the configured
    /// default and finally the process working directory.
    #[must_use]
    pub fn resolve_working_directory(&self, requested: Option<&str>) -> PathBuf {
        match requested.filter(|dir| !dir.trim().is_empty()) {
            Some(dir) => {
                let path = PathBuf::from(dir);
                if path.is_absolute() {
                    path
                } else {
                    self.base_directory().join(path)
                }
            }
            None => self.base_directory(),
        }
    }

    fn base_directory(&self) -> PathBuf {
        self.default_working_directory
            .clone()
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn validate(&self) -> Result<()> {
        let conn = &self.connection;
        if conn.heartbeat_seconds == 0 {
            return Err(AppError::Config(
                "connection.heartbeat_seconds must be greater than zero".into(),
            ));
        }
        if conn.reconnect_base_seconds == 0 {
            return Err(AppError::Config(
                "connection.reconnect_base_seconds must be greater than zero".into(),
            ));
        }
        if conn.reconnect_max_seconds < conn.reconnect_base_seconds {
            return Err(AppError::Config(
                "connection.reconnect_max_seconds must not be below reconnect_base_seconds".into(),
            ));
        }
        if conn.connect_timeout_seconds == 0 {
            return Err(AppError::Config(
                "connection.connect_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.agent.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "agent.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.agent.binary.trim().is_empty() {
            return Err(AppError::Config("agent.binary must not be empty".into()));
        }
        Ok(())
    }
}

/// Persistent configuration service with a load/save lifecycle.
///
/// Owns the on-disk `config.toml` and the relay token. The session manager
/// receives the resolved values from here instead of reading globals.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: GlobalConfig,
    token: Option<String>,
}

impl ConfigStore {
    /// Load the store from `path`; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file exists but cannot be parsed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            GlobalConfig::load_from_path(&path)?
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            GlobalConfig::default()
        };
        Ok(Self {
            path,
            config,
            token: None,
        })
    }

    /// Build a store around an in-memory config (nothing is read from disk).
    #[must_use]
    pub fn from_config(path: impl Into<PathBuf>, config: GlobalConfig) -> Self {
        Self {
            path: path.into(),
            config,
            token: None,
        }
    }

    /// Write the current configuration back to disk.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if serialization or the write fails.
    pub fn save(&self) -> Result<()> {
        let raw = toml::to_string_pretty(&self.config)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| AppError::Config(format!("failed to create config dir: {err}")))?;
        }
        fs::write(&self.path, raw)
            .map_err(|err| AppError::Config(format!("failed to write config: {err}")))
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Mutable access for CLI overrides.
    pub fn config_mut(&mut self) -> &mut GlobalConfig {
        &mut self.config
    }

    /// Agent identity, if assigned.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.config.agent_id.as_deref()
    }

    /// Assign the agent identity.
    pub fn set_agent_id(&mut self, agent_id: impl Into<String>) {
        self.config.agent_id = Some(agent_id.into());
    }

    /// Return the agent identity, generating and persisting one if absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a new identity cannot be saved.
    pub fn ensure_agent_id(&mut self) -> Result<String> {
        if let Some(id) = self.config.agent_id.clone() {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.config.agent_id = Some(id.clone());
        self.save()?;
        info!(agent_id = %id, "generated new agent identity");
        Ok(id)
    }

    /// Remote controller URL.
    #[must_use]
    pub fn server_url(&self) -> Option<&str> {
        self.config.server_url.as_deref()
    }

    /// Set the remote controller URL.
    pub fn set_server_url(&mut self, url: impl Into<String>) {
        self.config.server_url = Some(url.into());
    }

    /// Default working directory for commands.
    #[must_use]
    pub fn default_working_directory(&self) -> Option<&Path> {
        self.config.default_working_directory.as_deref()
    }

    /// Set the default working directory.
    pub fn set_default_working_directory(&mut self, dir: impl Into<PathBuf>) {
        self.config.default_working_directory = Some(dir.into());
    }

    /// Default allowed tools.
    #[must_use]
    pub fn allowed_tools(&self) -> &[String] {
        &self.config.allowed_tools
    }

    /// Replace the default allowed tools.
    pub fn set_allowed_tools(&mut self, tools: Vec<String>) {
        self.config.allowed_tools = tools;
    }

    /// Relay token, once loaded.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Set the token for this process without touching the keychain.
    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    /// Whether identity, endpoint, and token are all present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.config.agent_id.is_some()
            && self.config.server_url.as_deref().is_some_and(|u| !u.is_empty())
            && self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Load the relay token from the OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither source provides a token.
    pub async fn load_token(&mut self) -> Result<()> {
        self.token = Some(load_credential(TOKEN_KEY, TOKEN_ENV_VAR).await?);
        Ok(())
    }

    /// Persist `token` to the OS keychain and keep it for this process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain write fails.
    pub async fn store_token(&mut self, token: String) -> Result<()> {
        let value = token.clone();
        tokio::task::spawn_blocking(move || {
            keyring::Entry::new(KEYRING_SERVICE, TOKEN_KEY)
                .and_then(|entry| entry.set_password(&value))
        })
        .await
        .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?
        .map_err(|err| AppError::Config(format!("failed to store token: {err}")))?;
        self.token = Some(token);
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

    env::var(env_key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::Config(format!(
                "credential {keyring_key} not found in keychain or {env_key} env var"
            ))
        })
}
