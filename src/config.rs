use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::util::expand_tilde;

/// Environment override for the remote service base URL.
pub const URL_ENV: &str = "PROGRESS_SYNC_URL";

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            data_dir: None,
        }
    }
}

impl SyncConfig {
    /// Loads `~/.progress-sync/config.json`, falling back to defaults, then
    /// applies the environment override.
    pub fn load() -> Self {
        let config = config_path()
            .and_then(|path| load_config(&path))
            .unwrap_or_default();
        config.with_env_override(std::env::var(URL_ENV).ok())
    }

    fn with_env_override(mut self, url: Option<String>) -> Self {
        if let Some(url) = url
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
        {
            self.base_url = url;
        }
        self
    }

    /// Directory that holds the `local_save`, `cloud_save` and `login_data` files.
    pub fn data_dir(&self) -> Option<PathBuf> {
        match &self.data_dir {
            Some(dir) => Some(expand_tilde(dir)),
            None => config_root().map(|root| root.join("data")),
        }
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs.max(1))
    }
}

fn config_root() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".progress-sync"))
}

pub fn config_path() -> Option<PathBuf> {
    config_root().map(|root| root.join("config.json"))
}

/// Reads a config file; a missing or malformed file yields `None`.
pub fn load_config(path: &Path) -> Option<SyncConfig> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed config");
            None
        }
    }
}

pub fn save_config(path: &Path, config: &SyncConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}
