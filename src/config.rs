//! Configuration file for the session engines
//!
//! A TOML file names the server and tunes the engine timers. The credential
//! never lives in the file: `server.token_env` names the environment variable
//! it is read from when the connection target is built.

use crate::protocol::{AudioFormat, ClientHello};
use crate::session::{ConnectionTarget, EngineConfig, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    /// Media plane is started only when this section is present
    pub media: Option<MediaSection>,
}

/// Server section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// Server base URL, e.g. `http://192.168.1.20:8095`
    pub url: String,
    /// Environment variable containing the access token
    pub token_env: Option<String>,
}

/// Engine timers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_hello_timeout")]
    pub hello_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            hello_timeout_secs: default_hello_timeout(),
            request_timeout_secs: default_request_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_hello_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    20
}

fn default_event_buffer() -> usize {
    256
}

/// Reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_step")]
    pub backoff_step_secs: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_step_secs: default_backoff_step(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_step() -> u64 {
    2
}

/// Media plane player identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaSection {
    pub client_id: String,
    #[serde(default = "default_player_name")]
    pub name: String,
    /// Bytes of encoded audio the player can buffer ahead
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: u64,
    #[serde(default = "default_formats")]
    pub formats: Vec<AudioFormat>,
}

fn default_player_name() -> String {
    "ma-session".to_string()
}

fn default_buffer_capacity() -> u64 {
    1_048_576
}

fn default_formats() -> Vec<AudioFormat> {
    vec![AudioFormat::pcm(48_000, 16), AudioFormat::pcm(44_100, 16)]
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Parses the URL without resolving the credential
        ConnectionTarget::from_url(&self.server.url, None)
            .map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;

        let timers = [
            ("session.hello_timeout_secs", self.session.hello_timeout_secs),
            ("session.request_timeout_secs", self.session.request_timeout_secs),
            (
                "session.keepalive_interval_secs",
                self.session.keepalive_interval_secs,
            ),
            ("reconnect.backoff_step_secs", self.reconnect.backoff_step_secs),
        ];
        for (name, value) in timers {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be positive".to_string(),
            ));
        }
        if self.session.event_buffer == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.event_buffer must be positive".to_string(),
            ));
        }

        if let Some(media) = &self.media {
            if media.client_id.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "media.client_id must not be empty".to_string(),
                ));
            }
            if media.formats.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "media.formats must list at least one format".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Engine timers for either channel
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            hello_timeout: Duration::from_secs(self.session.hello_timeout_secs),
            request_timeout: Duration::from_secs(self.session.request_timeout_secs),
            keepalive_interval: Duration::from_secs(self.session.keepalive_interval_secs),
            event_buffer: self.session.event_buffer,
            reconnect: ReconnectConfig {
                max_attempts: self.reconnect.max_attempts,
                backoff_step: Duration::from_secs(self.reconnect.backoff_step_secs),
            },
        }
    }

    /// Get the access token from its environment variable
    ///
    /// An unset `token_env` means no credential. A named but missing
    /// variable is an error so a typo does not silently connect anonymously.
    pub fn credential(&self) -> Result<Option<String>, ConfigError> {
        match &self.server.token_env {
            None => Ok(None),
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
        }
    }

    /// Connection target with the credential resolved from the environment
    pub fn target(&self) -> Result<ConnectionTarget, ConfigError> {
        ConnectionTarget::from_url(&self.server.url, self.credential()?)
            .map_err(|e| ConfigError::InvalidUrl(e.to_string()))
    }

    /// Media plane client hello, when a `[media]` section is configured
    pub fn client_hello(&self) -> Option<ClientHello> {
        self.media.as_ref().map(|media| {
            ClientHello::player(
                media.client_id.clone(),
                media.name.clone(),
                media.formats.clone(),
                media.buffer_capacity,
            )
        })
    }
}
