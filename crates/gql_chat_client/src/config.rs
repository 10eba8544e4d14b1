//! Client config: `~/.gql-chat/config.yaml` plus `EIGHTBASE_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_API_ENDPOINT: &str = "EIGHTBASE_API_ENDPOINT";
pub const ENV_WS_ENDPOINT: &str = "EIGHTBASE_WS_ENDPOINT";
pub const ENV_WORKSPACE_ID: &str = "EIGHTBASE_WORKSPACE_ID";

/// HTTP API section.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ApiSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// WebSocket subscription section.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubscriptionsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    /// Omitted means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    /// `0` disables the keep-alive check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_timeout_secs: Option<u64>,
}

fn default_reconnect() -> bool {
    true
}

impl Default for SubscriptionsSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            reconnect: true,
            reconnect_attempts: None,
            reconnect_delay_ms: None,
            max_reconnect_delay_ms: None,
            connect_timeout_secs: None,
            keep_alive_timeout_secs: None,
        }
    }
}

impl SubscriptionsSection {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.unwrap_or(1_000))
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms.unwrap_or(30_000))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(30))
    }

    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        match self.keep_alive_timeout_secs.unwrap_or(30) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Full config. The workspace id is shared by the HTTP and WebSocket endpoints.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub subscriptions: SubscriptionsSection,
}

impl Config {
    /// Config built from the process environment only.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Overrides endpoints and workspace id with any `EIGHTBASE_*` variables set.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Same as [`Config::apply_env`] with a custom lookup. Empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get(ENV_API_ENDPOINT) {
            self.api.endpoint = Some(v);
        }
        if let Some(v) = get(ENV_WS_ENDPOINT) {
            self.subscriptions.endpoint = Some(v);
        }
        if let Some(v) = get(ENV_WORKSPACE_ID) {
            self.workspace_id = Some(v);
        }
    }

    pub fn workspace_id(&self) -> Result<&str, ConfigError> {
        self.workspace_id
            .as_deref()
            .ok_or(ConfigError::Missing("workspace_id"))
    }

    /// HTTP endpoint for queries and mutations: `{api.endpoint}/{workspace_id}`.
    pub fn api_url(&self) -> Result<String, ConfigError> {
        let endpoint = self
            .api
            .endpoint
            .as_deref()
            .ok_or(ConfigError::Missing("api.endpoint"))?;
        Ok(format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            self.workspace_id()?
        ))
    }

    /// WebSocket endpoint for subscriptions. The workspace goes in the
    /// connection params, not the URL.
    pub fn ws_url(&self) -> Result<&str, ConfigError> {
        self.subscriptions
            .endpoint
            .as_deref()
            .ok_or(ConfigError::Missing("subscriptions.endpoint"))
    }
}

/// Returns the default config file path: `~/.gql-chat/config.yaml` (platform-specific).
pub fn default_config_path() -> Option<PathBuf> {
    let home = home_dir()?;
    Some(home.join(".gql-chat").join("config.yaml"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

/// Load config from a YAML file. Environment overrides are not applied here.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Config load/save or lookup error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("missing config value: {0}")]
    Missing(&'static str),
}
