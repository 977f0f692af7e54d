//! Application configuration management.
//!
//! This module handles loading and saving the dashboard configuration: the
//! API endpoint, where the session token is persisted, the routes the guards
//! redirect to and the password reset policy.
//!
//! Configuration is stored at `~/.config/netpulse/config.json`.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "netpulse";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Where the session token is persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackendKind {
    /// OS keychain. On Linux this is the kernel keyring (cleared on reboot)
    /// unless built with the `secret-service` feature.
    Keyring,
    /// JSON file in the cache directory
    #[default]
    File,
    /// Process memory only; nothing survives a restart
    Memory,
}

/// How the forgot-password endpoint's "unknown email" answer is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PasswordResetPolicy {
    /// Acknowledge every request the same way, known email or not
    #[default]
    Uniform,
    /// Report `NotFound` for unknown emails
    Distinguish,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub credential_backend: CredentialBackendKind,
    pub login_route: String,
    pub dashboard_route: String,
    pub password_reset_policy: PasswordResetPolicy,
    /// Persisted tokens older than this are discarded at startup.
    pub token_max_age_minutes: Option<i64>,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            credential_backend: CredentialBackendKind::default(),
            login_route: "/login".to_string(),
            dashboard_route: "/dashboard".to_string(),
            password_reset_policy: PasswordResetPolicy::default(),
            token_max_age_minutes: None,
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"api_base_url": "https://noc.example.com/api", "credential_backend": "keyring"}"#;
        let config: Config = serde_json::from_str(json).expect("Failed to parse config JSON");
        assert_eq!(config.api_base_url, "https://noc.example.com/api");
        assert_eq!(config.credential_backend, CredentialBackendKind::Keyring);
        assert_eq!(config.login_route, "/login");
        assert_eq!(config.dashboard_route, "/dashboard");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.password_reset_policy, PasswordResetPolicy::Uniform);
        assert!(config.token_max_age_minutes.is_none());
    }

    #[test]
    fn test_reset_policy_names() {
        let config: Config = serde_json::from_str(r#"{"password_reset_policy": "distinguish"}"#)
            .expect("Failed to parse config JSON");
        assert_eq!(config.password_reset_policy, PasswordResetPolicy::Distinguish);
    }
}
