//! Bridge configuration loading.
//!
//! Reads `config.json` from the platform config directory and applies
//! environment overrides. Both the broker host and the Relay binary resolve
//! the socket path through here so they always agree on the endpoint.

use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_MESSAGE_LENGTH, SOCKET_FILE_NAME};

/// Configuration for the broker and the Relay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Path of the broker's Unix socket.
    pub socket_path: PathBuf,
    /// Maximum size of one message, in bytes.
    pub max_message_length: usize,
    /// Close connections that are not associated within this many seconds.
    /// `None` keeps them open indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_message_length: MAX_MESSAGE_LENGTH,
            handshake_timeout_secs: None,
        }
    }
}

impl BridgeConfig {
    /// Returns the configuration directory path.
    ///
    /// `BROWSER_BRIDGE_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = env::var("BROWSER_BRIDGE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("browser-bridge"))
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file yields the defaults; an unreadable or invalid one is an
    /// error.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?.unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Option<Self>> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", config_path.display()))?;
        Ok(Some(config))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = env::var("BROWSER_BRIDGE_SOCKET") {
            self.socket_path = PathBuf::from(path);
        }

        if let Ok(max) = env::var("BROWSER_BRIDGE_MAX_MESSAGE") {
            if let Ok(max) = max.parse::<usize>() {
                self.max_message_length = max;
            }
        }

        if let Ok(timeout) = env::var("BROWSER_BRIDGE_HANDSHAKE_TIMEOUT") {
            match timeout.parse::<u64>() {
                Ok(0) => self.handshake_timeout_secs = None,
                Ok(secs) => self.handshake_timeout_secs = Some(secs),
                Err(_) => log::warn!("Ignoring invalid BROWSER_BRIDGE_HANDSHAKE_TIMEOUT={timeout}"),
            }
        }
    }

    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }
}

/// Default socket location: the per-user runtime directory when the platform
/// has one, the temp directory otherwise.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(env::temp_dir)
        .join(SOCKET_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_message_length, 1024 * 1024);
        assert!(config.handshake_timeout().is_none());
        assert!(config.socket_path.ends_with(SOCKET_FILE_NAME));
    }

    #[test]
    fn test_config_file_without_timeout_parses() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{"socket_path":"/tmp/bridge.sock","max_message_length":4096}"#,
        )
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/bridge.sock"));
        assert_eq!(config.max_message_length, 4096);
        assert!(config.handshake_timeout_secs.is_none());
    }

    #[test]
    fn test_serialization_omits_disabled_timeout() {
        let json = serde_json::to_string(&BridgeConfig::default()).unwrap();
        assert!(!json.contains("handshake_timeout_secs"));

        let config = BridgeConfig {
            handshake_timeout_secs: Some(30),
            ..BridgeConfig::default()
        };
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(30)));
    }
}
