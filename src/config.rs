//! TOML configuration for the broker link
//!
//! Only `device.id`, `broker.url` and `broker.queue` are required; every
//! other field has a default. Broker credentials may come from environment
//! variables named in the file and are injected into the URL at runtime.

use crate::resilience::usage::UsageLimits;
use crate::supervisor::SupervisorSettings;
use crate::transport::amqp::client::{ConnectionSettings, DEFAULT_CONFIRMATION_QUEUE};
use crate::transport::amqp::health_monitor::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    pub device: DeviceSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub usage: UsageSection,
    #[serde(default)]
    pub outbox: OutboxSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `amqp://` or `amqps://` URL
    pub url: String,
    pub queue: String,
    #[serde(default = "default_confirmation_queue")]
    pub confirmation_queue: String,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_takeover_delay_secs")]
    pub takeover_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSection {
    #[serde(default = "default_max_daily_connections")]
    pub max_daily_connections: u32,
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: u32,
    #[serde(default = "default_max_daily_messages")]
    pub max_daily_messages: u64,
    /// JSON file holding the windowed counters
    #[serde(default = "default_usage_state_file")]
    pub state_file: PathBuf,
}

impl Default for UsageSection {
    fn default() -> Self {
        Self {
            max_daily_connections: default_max_daily_connections(),
            max_concurrent_connections: default_max_concurrent_connections(),
            max_daily_messages: default_max_daily_messages(),
            state_file: default_usage_state_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxSection {
    /// SQLite database file
    #[serde(default = "default_outbox_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for OutboxSection {
    fn default() -> Self {
        Self {
            path: default_outbox_path(),
            max_age_days: default_max_age_days(),
            batch_size: default_batch_size(),
            retry_interval_secs: default_retry_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_confirmation_queue() -> String {
    DEFAULT_CONFIRMATION_QUEUE.to_string()
}

fn default_prefetch() -> u16 {
    10
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_connection_timeout_secs() -> u64 {
    15
}

fn default_handler_timeout_secs() -> u64 {
    60
}

fn default_publish_timeout_secs() -> u64 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    5000
}

fn default_max_consecutive_failures() -> u32 {
    100
}

fn default_takeover_delay_secs() -> u64 {
    30
}

fn default_max_daily_connections() -> u32 {
    1000
}

fn default_max_concurrent_connections() -> u32 {
    2
}

fn default_max_daily_messages() -> u64 {
    100_000
}

fn default_usage_state_file() -> PathBuf {
    PathBuf::from("broker-link-usage.json")
}

fn default_outbox_path() -> PathBuf {
    PathBuf::from("broker-link-outbox.db")
}

fn default_max_age_days() -> u64 {
    3
}

fn default_batch_size() -> i64 {
    100
}

fn default_retry_interval_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    6 * 60 * 60
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
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LinkConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: LinkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;

        let url = Url::parse(&self.broker.url)
            .map_err(|e| ConfigError::InvalidConfig(format!("broker.url: {e}")))?;
        if !matches!(url.scheme(), "amqp" | "amqps") {
            return Err(ConfigError::InvalidConfig(format!(
                "broker.url must use amqp:// or amqps://, got {}://",
                url.scheme()
            )));
        }

        if self.broker.queue.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.queue must not be empty".to_string(),
            ));
        }
        if self.broker.queue == self.broker.confirmation_queue {
            return Err(ConfigError::InvalidConfig(
                "broker.queue and broker.confirmation_queue must differ".to_string(),
            ));
        }
        if self.broker.prefetch == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.prefetch must be greater than 0".to_string(),
            ));
        }
        if self.broker.max_consecutive_failures == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.max_consecutive_failures must be greater than 0".to_string(),
            ));
        }
        if self.outbox.batch_size <= 0 {
            return Err(ConfigError::InvalidConfig(
                "outbox.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.outbox.retry_interval_secs == 0 || self.outbox.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "outbox intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    pub fn get_broker_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    pub fn get_broker_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }

    /// Broker URL with environment credentials applied to its userinfo
    pub fn resolved_broker_url(&self) -> Result<String, ConfigError> {
        let username = self.get_broker_username();
        let password = self.get_broker_password();
        if username.is_none() && password.is_none() {
            return Ok(self.broker.url.clone());
        }

        let mut url = Url::parse(&self.broker.url)
            .map_err(|e| ConfigError::InvalidConfig(format!("broker.url: {e}")))?;
        if let Some(username) = username {
            url.set_username(&username).map_err(|_| {
                ConfigError::InvalidConfig("broker.url cannot carry credentials".to_string())
            })?;
        }
        if let Some(password) = password {
            url.set_password(Some(&password)).map_err(|_| {
                ConfigError::InvalidConfig("broker.url cannot carry credentials".to_string())
            })?;
        }
        Ok(url.to_string())
    }

    /// Connection settings for the configured queue
    pub fn connection_settings(&self) -> Result<ConnectionSettings, ConfigError> {
        let broker = &self.broker;
        let mut settings =
            ConnectionSettings::new(self.resolved_broker_url()?, &broker.queue, &self.device.id);
        settings.confirmation_queue = broker.confirmation_queue.clone();
        settings.prefetch = broker.prefetch;
        settings.heartbeat = Duration::from_secs(broker.heartbeat_secs);
        settings.connection_timeout = Duration::from_secs(broker.connection_timeout_secs);
        settings.handler_timeout = Duration::from_secs(broker.handler_timeout_secs);
        settings.publish_timeout = Duration::from_secs(broker.publish_timeout_secs);
        settings.reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(broker.reconnect_base_delay_ms),
            max_consecutive_failures: broker.max_consecutive_failures,
            takeover_delay: Duration::from_secs(broker.takeover_delay_secs),
        };
        Ok(settings)
    }

    pub fn usage_limits(&self) -> UsageLimits {
        UsageLimits {
            max_daily_connections: self.usage.max_daily_connections,
            max_concurrent_connections: self.usage.max_concurrent_connections,
            max_daily_messages: self.usage.max_daily_messages,
            ..UsageLimits::default()
        }
    }

    pub fn outbox_max_age(&self) -> Duration {
        Duration::from_secs(self.outbox.max_age_days * 24 * 60 * 60)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            outbox_batch_size: self.outbox.batch_size,
            outbox_retry_interval: Duration::from_secs(self.outbox.retry_interval_secs),
            outbox_sweep_interval: Duration::from_secs(self.outbox.sweep_interval_secs),
            outbox_max_age: self.outbox_max_age(),
            ..SupervisorSettings::default()
        }
    }

    /// Copy safe to print: credentials in the URL are masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.broker.url = crate::transport::amqp::connection::redact_userinfo(&copy.broker.url);
        copy
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"

[broker]
url = "amqp://localhost:5672"
queue = "contact_sync_queue"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate device ID format
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
