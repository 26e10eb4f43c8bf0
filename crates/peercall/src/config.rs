//! Configuration management for PeerCall.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/peercall/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::{CoordinatorOptions, DEFAULT_DATA_CHANNEL_LABEL};
use crate::media::MediaConstraints;
use crate::network::{IceConfig, IceServer, WebSocketConfig, DEFAULT_STUN_SERVERS};

pub use crate::network::websocket::DEFAULT_SIGNALING_URL;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("signaling_url must start with ws:// or wss://, got {0}")]
    InvalidSignalingUrl(String),

    #[error("ICE server URL must start with stun:, stuns:, turn: or turns:, got {0}")]
    InvalidIceUrl(String),

    #[error("TURN server {0} needs both username and credential")]
    MissingTurnCredentials(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("initial_backoff_ms ({initial}) must be positive and not exceed max_backoff_ms ({max})")]
    InvalidBackoff { initial: u64, max: u64 },

    #[error("heartbeat_interval_secs must be greater than 0")]
    InvalidHeartbeatInterval,

    #[error("media must request at least one of video or audio")]
    NoMediaRequested,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const ICE_URL_SCHEMES: &[&str] = &["stun:", "stuns:", "turn:", "turns:"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General node configuration.
    pub node: NodeConfig,

    /// Signaling and ICE configuration.
    pub network: NetworkConfig,

    /// Which local media to capture.
    pub media: MediaConfig,

    /// Call behaviour.
    pub call: CallConfig,
}

/// General node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Network configuration for signaling and ICE.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// URL of the signaling server.
    pub signaling_url: String,

    /// List of STUN servers for NAT traversal.
    pub stun_servers: Vec<String>,

    /// TURN relays, each with its own credentials.
    pub turn_servers: Vec<TurnServerConfig>,

    /// Reconnect to the signaling server after a drop.
    pub auto_reconnect: bool,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Interval between WebSocket pings.
    pub heartbeat_interval_secs: u64,
}

/// A TURN relay entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TurnServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Local media configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    pub video: bool,
    pub audio: bool,
}

/// Call configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    /// Label of the data channel opened when placing a call.
    pub data_channel_label: String,
    /// Select the caller of an incoming offer when no peer is selected.
    pub select_caller: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: Vec::new(),
            auto_reconnect: true,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            select_caller: true,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peercall")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PEERCALL_SIGNALING_URL: Override signaling server URL
    /// - PEERCALL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PEERCALL_SIGNALING_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding signaling_url from environment: {}", url);
                self.network.signaling_url = url;
            }
        }

        if let Ok(level) = std::env::var("PEERCALL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.node.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.network.signaling_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidSignalingUrl(url.clone()));
        }

        let turn_urls = self.network.turn_servers.iter().flat_map(|t| t.urls.iter());
        for ice_url in self.network.stun_servers.iter().chain(turn_urls) {
            if !ICE_URL_SCHEMES.iter().any(|scheme| ice_url.starts_with(scheme)) {
                return Err(ConfigError::InvalidIceUrl(ice_url.clone()));
            }
        }

        for turn in &self.network.turn_servers {
            let has_credentials = turn.username.as_deref().is_some_and(|u| !u.is_empty())
                && turn.credential.as_deref().is_some_and(|c| !c.is_empty());
            if !has_credentials {
                return Err(ConfigError::MissingTurnCredentials(turn.urls.join(",")));
            }
        }

        let level = self.node.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.node.log_level.clone()));
        }

        let (initial, max) = (self.network.initial_backoff_ms, self.network.max_backoff_ms);
        if initial == 0 || initial > max {
            return Err(ConfigError::InvalidBackoff { initial, max });
        }

        if self.network.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }

        if !self.media.video && !self.media.audio {
            return Err(ConfigError::NoMediaRequested);
        }

        Ok(())
    }

    /// ICE servers handed to the engine for every new connection.
    pub fn ice_servers(&self) -> IceConfig {
        let stun = self.network.stun_servers.iter().map(IceServer::stun);
        let turn = self.network.turn_servers.iter().map(|t| IceServer {
            urls: t.urls.clone(),
            username: t.username.clone(),
            credential: t.credential.clone(),
        });
        IceConfig {
            ice_servers: stun.chain(turn).collect(),
        }
    }

    /// Settings for the signaling WebSocket.
    pub fn websocket(&self) -> WebSocketConfig {
        WebSocketConfig::new(self.network.signaling_url.clone())
            .with_auto_reconnect(self.network.auto_reconnect)
            .with_initial_backoff(Duration::from_millis(self.network.initial_backoff_ms))
            .with_max_backoff(Duration::from_millis(self.network.max_backoff_ms))
            .with_heartbeat_interval(Duration::from_secs(self.network.heartbeat_interval_secs))
    }

    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            video: self.media.video,
            audio: self.media.audio,
        }
    }

    /// Settings for the call coordinator.
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            ice: self.ice_servers(),
            constraints: self.media_constraints(),
            data_channel_label: self.call.data_channel_label.clone(),
            select_caller: self.call.select_caller,
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Save configuration to the default path.
    pub fn save_default(&self) -> Result<()> {
        self.save(default_config_path())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn turn(url: &str, username: Option<&str>, credential: Option<&str>) -> TurnServerConfig {
        TurnServerConfig {
            urls: vec![url.to_string()],
            username: username.map(str::to_string),
            credential: credential.map(str::to_string),
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.node.log_level, "info");
        assert_eq!(config.network.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.network.stun_servers.len(), 2);
        assert!(config.network.turn_servers.is_empty());
        assert!(config.network.auto_reconnect);
        assert!(config.media.video && config.media.audio);
        assert_eq!(config.call.data_channel_label, "chat");
        assert!(config.call.select_caller);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[node]
log_level = "debug"

[media]
video = false

[[network.turn_servers]]
urls = ["turn:relay.example.com:3478"]
username = "alice"
credential = "secret"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.node.log_level, "debug");
        assert!(!config.media.video);
        assert!(config.media.audio);
        assert_eq!(config.network.turn_servers.len(), 1);
        assert_eq!(config.network.signaling_url, DEFAULT_SIGNALING_URL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = Config::from_toml("[node\nlog_level = 1").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let err = Config::from_toml("[network]\nauto_reconnect = \"yes\"").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_to_toml_round_trip() {
        let mut config = Config::default();
        config.network.turn_servers.push(turn("turns:relay.example.com", Some("u"), Some("p")));
        config.call.data_channel_label = "files".to_string();

        let parsed = Config::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.node.log_level = "warn".to_string();
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_file_names_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("peercall/config.toml"));
    }

    #[test]
    fn test_validate_signaling_url() {
        let mut config = Config::default();
        config.network.signaling_url = "http://localhost:3000".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidSignalingUrl(
                "http://localhost:3000".to_string()
            ))
        );

        config.network.signaling_url = "wss://signal.example.com".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ice_urls() {
        let mut config = Config::default();
        config.network.stun_servers = vec!["stun.example.com:3478".to_string()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidIceUrl("stun.example.com:3478".to_string()))
        );

        config.network.stun_servers = vec!["stuns:stun.example.com".to_string()];
        config.network.turn_servers = vec![turn("relay.example.com", Some("u"), Some("p"))];
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidIceUrl("relay.example.com".to_string()))
        );
    }

    #[test]
    fn test_validate_turn_credentials() {
        let mut config = Config::default();
        config.network.turn_servers = vec![turn("turn:relay.example.com", Some("u"), None)];
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingTurnCredentials(
                "turn:relay.example.com".to_string()
            ))
        );

        config.network.turn_servers = vec![turn("turn:relay.example.com", Some(""), Some("p"))];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingTurnCredentials(_))
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.node.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.node.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_backoff() {
        let mut config = Config::default();
        config.network.initial_backoff_ms = 60_000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBackoff {
                initial: 60_000,
                max: 30_000
            })
        );

        config.network.initial_backoff_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackoff { .. })
        ));
    }

    #[test]
    fn test_validate_heartbeat_interval() {
        let config = Config::from_toml("[network]\nheartbeat_interval_secs = 0").unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHeartbeatInterval)
        );

        let mut config = Config::default();
        config.network.heartbeat_interval_secs = 1;
        assert!(config.validate().is_ok());
        assert_eq!(config.websocket().heartbeat_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_media() {
        let mut config = Config::default();
        config.media.video = false;
        config.media.audio = false;
        assert_eq!(config.validate(), Err(ConfigError::NoMediaRequested));
    }

    #[test]
    fn test_ice_servers() {
        let mut config = Config::default();
        config.network.stun_servers = vec!["stun:stun.example.com:3478".to_string()];
        config.network.turn_servers = vec![turn("turn:relay.example.com", Some("u"), Some("p"))];

        let ice = config.ice_servers();
        assert_eq!(
            ice.ice_servers,
            vec![
                IceServer::stun("stun:stun.example.com:3478"),
                IceServer::turn("turn:relay.example.com", "u", "p"),
            ]
        );
    }

    #[test]
    fn test_default_ice_servers_match_engine_default() {
        assert_eq!(Config::default().ice_servers(), IceConfig::default());
    }

    #[test]
    fn test_websocket_and_coordinator_settings() {
        let mut config = Config::default();
        config.network.auto_reconnect = false;
        config.network.initial_backoff_ms = 250;
        config.network.heartbeat_interval_secs = 5;
        config.media.audio = false;
        config.call.data_channel_label = "files".to_string();

        let ws = config.websocket();
        assert_eq!(ws.server_url, DEFAULT_SIGNALING_URL);
        assert!(!ws.auto_reconnect);
        assert_eq!(ws.initial_backoff, Duration::from_millis(250));
        assert_eq!(ws.max_backoff, Duration::from_millis(30_000));
        assert_eq!(ws.heartbeat_interval, Duration::from_secs(5));

        let options = config.coordinator_options();
        assert_eq!(options.data_channel_label, "files");
        assert!(options.select_caller);
        assert!(options.constraints.video);
        assert!(!options.constraints.audio);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("PEERCALL_SIGNALING_URL", "wss://override.example.com");
        std::env::set_var("PEERCALL_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("PEERCALL_SIGNALING_URL");
        std::env::remove_var("PEERCALL_LOG_LEVEL");

        assert_eq!(config.network.signaling_url, "wss://override.example.com");
        assert_eq!(config.node.log_level, "trace");
    }

    #[test]
    #[serial]
    fn test_empty_env_overrides_ignored() {
        std::env::set_var("PEERCALL_SIGNALING_URL", "");
        std::env::set_var("PEERCALL_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("PEERCALL_SIGNALING_URL");
        std::env::remove_var("PEERCALL_LOG_LEVEL");

        assert_eq!(config, Config::default());
    }
}
