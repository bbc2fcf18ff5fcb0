//! # Configuration Management
//!
//! Centralized configuration for controller, host and client nodes.
//!
//! This module provides structured configuration for the acceptor side (controller, hosts
//! accepting instances), the initiator side (reconnect policy, request timeout), per-session
//! limits and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`CLUSTER_LINK_*`)
//!
//! ## Operational Considerations
//! - The session timeout bounds how long a dropped peer keeps its unacknowledged traffic
//! - The send buffer cap bounds memory per session; overflow closes the session
//! - The backoff reset window should exceed the maximum backoff delay

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Protocol version announced in `hello`; peers must agree on major.minor
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// Max allowed frame size (e.g. 16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default cap on unacknowledged outgoing messages per session
pub const MAX_SEND_BUFFER: usize = 10_000;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LinkConfig {
    /// Acceptor-side configuration
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Initiator-side configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Per-session limits
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LinkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("CLUSTER_LINK_BIND_ADDRESS") {
            config.controller.bind_address = addr;
        }

        if let Ok(addr) = std::env::var("CLUSTER_LINK_CONTROLLER_ADDRESS") {
            config.client.controller_address = addr;
        }

        if let Some(val) = env_millis("CLUSTER_LINK_SESSION_TIMEOUT_MS")? {
            config.controller.session_timeout = val;
        }

        if let Some(val) = env_millis("CLUSTER_LINK_HEARTBEAT_INTERVAL_MS")? {
            config.controller.heartbeat_interval = val;
        }

        if let Some(val) = env_millis("CLUSTER_LINK_REQUEST_TIMEOUT_MS")? {
            config.client.request_timeout = val;
        }

        if let Ok(limit) = std::env::var("CLUSTER_LINK_MAX_SEND_BUFFER") {
            config.session.max_send_buffer = limit.parse::<usize>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid CLUSTER_LINK_MAX_SEND_BUFFER: {e}"))
            })?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.controller.validate());
        errors.extend(self.client.validate());
        errors.extend(self.session.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Acceptor-side configuration (controller, or a host accepting instances)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Listen address (e.g., "127.0.0.1:8080")
    pub bind_address: String,

    /// How long a dropped session may be resumed
    #[serde(with = "duration_serde")]
    pub session_timeout: Duration,

    /// Interval for heartbeat messages, announced to initiators in `ready`
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Time allowed for the first handshake frame
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Maximum number of live sessions
    pub max_sessions: usize,

    /// Timeout for graceful shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("127.0.0.1:8080"),
            session_timeout: timeout::SESSION_TIMEOUT,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            max_sessions: 1000,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ControllerConfig {
    /// Validate acceptor configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address.is_empty() {
            errors.push("Bind address cannot be empty".to_string());
        } else if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid bind address format: '{}' (expected format: '0.0.0.0:8080')",
                self.bind_address
            ));
        }

        if self.heartbeat_interval.as_millis() < 10 {
            errors.push("Heartbeat interval too short (minimum: 10ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.session_timeout < self.heartbeat_interval {
            errors.push("Session timeout must not be shorter than the heartbeat interval".to_string());
        }

        if self.handshake_timeout.as_millis() < 10 {
            errors.push("Handshake timeout too short (minimum: 10ms)".to_string());
        }

        if self.max_sessions == 0 {
            errors.push("Max sessions must be greater than 0".to_string());
        } else if self.max_sessions > 100_000 {
            errors.push(format!(
                "Max sessions very high: {} (ensure system resources can support this)",
                self.max_sessions
            ));
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Initiator-side configuration (hosts, instances and control clients)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Address of the acceptor to connect to
    pub controller_address: String,

    /// Timeout for a single connection attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Timeout for request/response round trips
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// First reconnect delay
    #[serde(with = "duration_serde")]
    pub reconnect_base_delay: Duration,

    /// Upper bound for reconnect delays
    #[serde(with = "duration_serde")]
    pub reconnect_max_delay: Duration,

    /// Idle period after which the backoff sequence starts over
    #[serde(with = "duration_serde")]
    pub reconnect_reset: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            controller_address: String::from("127.0.0.1:8080"),
            connect_timeout: timeout::DEFAULT_TIMEOUT,
            request_timeout: timeout::REQUEST_TIMEOUT,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_reset: Duration::from_secs(120),
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.controller_address.is_empty() {
            errors.push("Controller address cannot be empty".to_string());
        }

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        }

        if self.request_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        }

        if self.reconnect_base_delay.is_zero() {
            errors.push("Reconnect base delay must be greater than 0".to_string());
        }

        if self.reconnect_max_delay < self.reconnect_base_delay {
            errors.push("Reconnect max delay must not be shorter than the base delay".to_string());
        }

        if self.reconnect_reset <= self.reconnect_max_delay {
            errors.push(
                "Reconnect reset window should exceed the max delay, or backoff never grows"
                    .to_string(),
            );
        }

        errors
    }

    pub fn backoff(&self) -> crate::utils::backoff::ExponentialBackoff {
        crate::utils::backoff::ExponentialBackoff::new(
            self.reconnect_base_delay,
            self.reconnect_max_delay,
            self.reconnect_reset,
        )
        .with_jitter()
    }
}

/// Per-session limits shared by both sides
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Maximum number of unacknowledged outgoing messages kept for replay
    pub max_send_buffer: usize,

    /// Maximum frame size in bytes
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_send_buffer: MAX_SEND_BUFFER,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_send_buffer == 0 {
            errors.push("Max send buffer must be greater than 0".to_string());
        }

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("cluster-link"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
