//! Configuration loading and persistence.
//!
//! Settings come from `config.json` in the config directory, then
//! `PIPELINE_RUN_*` environment variables, then CLI flags (applied by the
//! binary). The token is never written to disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};

use crate::channel::SocketConfig;
use crate::constants;

const CONFIG_FILE: &str = "config.json";

/// Configuration for the pipeline-run client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// URL of the pipeline server.
    pub server_url: String,
    /// Bearer token - NOT serialized to disk (env only).
    #[serde(skip)]
    pub token: Option<String>,
    /// Request a channel token before joining a run.
    pub use_auth: bool,
    /// Delay between connecting and joining, in milliseconds.
    pub start_delay_ms: u64,
    /// Join acknowledgement timeout, in seconds.
    pub join_timeout_secs: u64,
    /// Socket heartbeat interval, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Playback end threshold for voice state, in milliseconds.
    pub playback_end_threshold_ms: u64,
    /// Page size for run log pagination.
    pub logs_per_page: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: constants::DEFAULT_SERVER_URL.to_string(),
            token: None,
            use_auth: false,
            start_delay_ms: duration_ms(constants::START_DELAY),
            join_timeout_secs: constants::JOIN_TIMEOUT.as_secs(),
            heartbeat_interval_secs: constants::HEARTBEAT_INTERVAL.as_secs(),
            playback_end_threshold_ms: duration_ms(constants::PLAYBACK_END_THRESHOLD),
            logs_per_page: constants::LOGS_PER_PAGE,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `PIPELINE_RUN_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir (Linux: ~/.config/pipeline-run)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("PIPELINE_RUN_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("pipeline-run")
        };
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads `config.json` from `dir`, or defaults when it does not exist.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Applies `PIPELINE_RUN_*` overrides read through `lookup`.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("PIPELINE_RUN_SERVER_URL") {
            self.server_url = server_url;
        }

        // Token from env var only
        if let Some(token) = lookup("PIPELINE_RUN_TOKEN").filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }

        if let Some(use_auth) = lookup("PIPELINE_RUN_USE_AUTH") {
            self.use_auth = matches!(use_auth.as_str(), "1" | "true" | "yes");
        }

        if let Some(value) = lookup("PIPELINE_RUN_START_DELAY_MS") {
            match value.parse() {
                Ok(ms) => self.start_delay_ms = ms,
                Err(_) => log::warn!("Ignoring invalid PIPELINE_RUN_START_DELAY_MS: {}", value),
            }
        }

        if let Some(value) = lookup("PIPELINE_RUN_JOIN_TIMEOUT_SECS") {
            match value.parse() {
                Ok(secs) => self.join_timeout_secs = secs,
                Err(_) => log::warn!("Ignoring invalid PIPELINE_RUN_JOIN_TIMEOUT_SECS: {}", value),
            }
        }
    }

    /// Persists the current configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the current configuration to `dir`.
    /// Note: the token is NOT saved.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Sets one persisted key from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server_url" => self.server_url = value.to_string(),
            "use_auth" => self.use_auth = value.parse().context("use_auth must be true or false")?,
            "start_delay_ms" => self.start_delay_ms = value.parse().context("start_delay_ms must be a number")?,
            "join_timeout_secs" => {
                self.join_timeout_secs = value.parse().context("join_timeout_secs must be a number")?;
            }
            "heartbeat_interval_secs" => {
                self.heartbeat_interval_secs = value.parse().context("heartbeat_interval_secs must be a number")?;
            }
            "playback_end_threshold_ms" => {
                self.playback_end_threshold_ms =
                    value.parse().context("playback_end_threshold_ms must be a number")?;
            }
            "logs_per_page" => self.logs_per_page = value.parse().context("logs_per_page must be a number")?,
            "token" => anyhow::bail!("token is read from PIPELINE_RUN_TOKEN and never stored"),
            other => anyhow::bail!("Unknown config key: {}", other),
        }
        Ok(())
    }

    /// Delay between connecting and joining.
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    /// Playback end threshold.
    pub fn playback_end_threshold(&self) -> Duration {
        Duration::from_millis(self.playback_end_threshold_ms)
    }

    /// Socket settings derived from this config.
    pub fn socket_config(&self) -> SocketConfig {
        let mut socket = SocketConfig::new(&self.server_url);
        socket.join_timeout = Duration::from_secs(self.join_timeout_secs);
        socket.heartbeat_interval = Duration::from_secs(self.heartbeat_interval_secs.max(1));
        if let Some(token) = &self.token {
            socket.headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server_url, constants::DEFAULT_SERVER_URL);
        assert_eq!(config.start_delay(), Duration::from_millis(500));
        assert_eq!(config.playback_end_threshold(), Duration::from_millis(150));
        assert_eq!(config.logs_per_page, 20);
        assert!(!config.use_auth);
    }

    #[test]
    fn test_config_serialization_excludes_token() {
        let config = Config {
            token: Some("secret_token".to_string()),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();

        assert!(!json.contains("secret_token"));
        assert!(!json.contains("\"token\""));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.set("server_url", "https://pipelines.example").unwrap();
        config.set("start_delay_ms", "0").unwrap();
        config.save_to(dir.path()).unwrap();

        let loaded = Config::load_from(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load_from(dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"use_auth": true}"#).unwrap();
        let config = Config::load_from(dir.path()).unwrap();
        assert!(config.use_auth);
        assert_eq!(config.join_timeout_secs, 10);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PIPELINE_RUN_SERVER_URL", "https://override"),
            ("PIPELINE_RUN_TOKEN", "tok"),
            ("PIPELINE_RUN_USE_AUTH", "true"),
            ("PIPELINE_RUN_START_DELAY_MS", "nope"),
            ("PIPELINE_RUN_JOIN_TIMEOUT_SECS", "3"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.server_url, "https://override");
        assert_eq!(config.token.as_deref(), Some("tok"));
        assert!(config.use_auth);
        assert_eq!(config.start_delay_ms, 500);
        assert_eq!(config.join_timeout_secs, 3);
    }

    #[test]
    fn test_set_rejects_unknown_and_token() {
        let mut config = Config::default();
        assert!(config.set("colour", "blue").is_err());
        assert!(config.set("token", "x").is_err());
        assert!(config.set("logs_per_page", "many").is_err());
    }

    #[test]
    fn test_socket_config_carries_token() {
        let config = Config {
            token: Some("tok".into()),
            join_timeout_secs: 4,
            ..Config::default()
        };
        let socket = config.socket_config();
        assert_eq!(socket.join_timeout, Duration::from_secs(4));
        assert!(socket
            .headers
            .contains(&("Authorization".to_string(), "Bearer tok".to_string())));
    }
}
