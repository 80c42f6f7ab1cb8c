//! Client settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/kernel-relay/settings.json
//! - Linux: ~/.config/kernel-relay/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\kernel-relay\settings.json
//!
//! Missing fields take their defaults, and a missing or unreadable file
//! yields `RelaySettings::default()`. The `JUPYTER_TOKEN` environment
//! variable overrides the stored token.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::connection::ReconnectPolicy;

/// Environment variable that overrides the stored server token.
pub const TOKEN_ENV_VAR: &str = "JUPYTER_TOKEN";

fn default_server_url() -> String {
    "http://localhost:8888".to_string()
}

fn default_kernel_name() -> String {
    "python3".to_string()
}

fn default_reconnect_limit() -> u32 {
    7
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Settings for talking to a Jupyter server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Base URL of the Jupyter server (http or https)
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// API token sent as `Authorization: token <t>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Kernel spec used when creating new sessions
    #[serde(default = "default_kernel_name")]
    pub kernel_name: String,

    /// Username stamped on outgoing message headers
    #[serde(default)]
    pub username: String,

    /// Reconnection attempts before the connection is declared dead
    #[serde(default = "default_reconnect_limit")]
    pub reconnect_limit: u32,

    /// Delay before the first reconnection attempt; doubles each attempt
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Timeout for shell request/reply round trips
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: None,
            kernel_name: default_kernel_name(),
            username: String::new(),
            reconnect_limit: default_reconnect_limit(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RelaySettings {
    /// Reconnection policy derived from these settings.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            self.reconnect_limit,
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Apply an environment token, if one is set and non-empty.
    pub fn with_env_token(mut self, env_token: Option<String>) -> Self {
        if let Some(token) = env_token.filter(|t| !t.trim().is_empty()) {
            self.token = Some(token);
        }
        self
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    crate::config_dir().join("settings.json")
}

/// Load settings from a specific file, returning defaults if it is missing
/// or cannot be parsed.
pub fn load_settings_from(path: &Path) -> RelaySettings {
    if !path.exists() {
        return RelaySettings::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(
                    "[settings] Ignoring unparseable settings file {:?}: {}",
                    path, e
                );
                RelaySettings::default()
            }
        },
        Err(e) => {
            warn!("[settings] Could not read {:?}: {}", path, e);
            RelaySettings::default()
        }
    }
}

/// Load settings from disk and apply the `JUPYTER_TOKEN` override.
pub fn load_settings() -> RelaySettings {
    load_settings_from(&settings_path()).with_env_token(std::env::var(TOKEN_ENV_VAR).ok())
}

/// Save settings to a specific file, creating parent directories.
pub fn save_settings_to(path: &Path, settings: &RelaySettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// Save settings to disk
pub fn save_settings(settings: &RelaySettings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}
