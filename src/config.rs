//! Client configuration
//!
//! Loaded once from a TOML file at startup. This is the operator-facing
//! configuration (broker, topic, retry delays, storage location), distinct
//! from the user-tunable [`Settings`](crate::settings::Settings) that are
//! persisted through the key-value store.

use crate::protocol::validate_topic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main client configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// MQTT broker and subscription settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host[:port]` or `mqtts://host[:port]`
    pub broker_url: String,
    /// Topic the device publishes readings on
    pub topic: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Prefix for the MQTT client id (a unique suffix is appended per connection)
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// MQTT keep-alive in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Handshake timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_client_id_prefix() -> String {
    "co2-telemetry".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

/// Fixed retry delays for the connection manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Delay after a failed handshake
    #[serde(default = "default_connect_failure_delay_ms")]
    pub connect_failure_delay_ms: u64,
    /// Delay after losing an established connection
    #[serde(default = "default_connection_lost_delay_ms")]
    pub connection_lost_delay_ms: u64,
    /// Delay between tearing down and re-attempting on an explicit reconnect
    #[serde(default = "default_manual_reconnect_delay_ms")]
    pub manual_reconnect_delay_ms: u64,
}

fn default_connect_failure_delay_ms() -> u64 {
    10_000
}

fn default_connection_lost_delay_ms() -> u64 {
    5_000
}

fn default_manual_reconnect_delay_ms() -> u64 {
    1_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            connect_failure_delay_ms: default_connect_failure_delay_ms(),
            connection_lost_delay_ms: default_connection_lost_delay_ms(),
            manual_reconnect_delay_ms: default_manual_reconnect_delay_ms(),
        }
    }
}

/// Where persisted settings and history live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Broker address extracted from `broker_url`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    /// Parse `mqtt://` / `mqtts://` URLs, defaulting the port by scheme
    pub fn parse(broker_url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

        let tls = match url.scheme() {
            "mqtt" => false,
            "mqtts" => true,
            other => {
                return Err(ConfigError::InvalidBrokerUrl(format!(
                    "unsupported scheme '{other}' in {broker_url}"
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Username/password resolved from the environment at connect time
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] crate::protocol::ValidationError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        Endpoint::parse(&self.mqtt.broker_url)?;
        validate_topic(&self.mqtt.topic)?;

        if self.mqtt.client_id_prefix.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.client_id_prefix must not be empty".to_string(),
            ));
        }
        if self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let delays = [
            ("connect_failure_delay_ms", self.retry.connect_failure_delay_ms),
            ("connection_lost_delay_ms", self.retry.connection_lost_delay_ms),
            ("manual_reconnect_delay_ms", self.retry.manual_reconnect_delay_ms),
        ];
        for (name, value) in delays {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "retry.{name} must be greater than 0"
                )));
            }
        }

        Ok(())
    }

    /// Broker endpoint parsed from the configured URL
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::parse(&self.mqtt.broker_url)
    }

    /// Handshake timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt.connect_timeout_secs)
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Resolve broker credentials from the environment
    ///
    /// Returns `None` when no username is configured or the variable is unset.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = Self::get_env_var_optional(self.mqtt.username_env.as_ref())?;
        let password =
            Self::get_env_var_optional(self.mqtt.password_env.as_ref()).unwrap_or_default();
        Some(Credentials { username, password })
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
topic = "sensors/esp32-co2-01/data"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
