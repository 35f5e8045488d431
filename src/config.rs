//! # Configuration Management
//!
//! Centralized configuration for servers, clients and the per-connection transport.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`]
//! - Environment overrides via [`NetworkConfig::from_env`]
//! - Direct instantiation with defaults
//!
//! Durations are written as integer milliseconds in TOML.

use crate::error::{NetError, Result};
use crate::utils::compression::CompressionKind;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Capacity of a regular connection's outbound queue
pub const SEND_QUEUE_SIZE: usize = 512;

/// Capacity of an RPC client connection's outbound queue
pub const RPC_SEND_QUEUE_SIZE: usize = 8192;

/// Default socket receive/send buffer size in bytes
pub const SOCKET_BUFFER_SIZE: usize = 1024;

/// Max accepted body length of a single frame (1 MiB)
pub const MAX_PACKET_LEN: usize = 1024 * 1024;

/// Default ceiling on concurrently served connections
pub const MAX_CONCURRENT: usize = 40960;

/// Bodies longer than this are compressed when compression is enabled
pub const COMPRESSION_THRESHOLD: usize = 512;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Socket options applied on dial and accept
    #[serde(default)]
    pub socket: SocketConfig,

    /// Per-connection framing, queue and deadline settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| NetError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| NetError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| NetError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `FRAMELINK_*` environment variables.
    ///
    /// Unparseable values are ignored and leave the default in place.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("FRAMELINK_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("FRAMELINK_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Some(val) = env_parse::<usize>("FRAMELINK_MAX_CONCURRENT") {
            config.server.max_concurrent = val;
        }

        if let Some(val) = env_parse::<usize>("FRAMELINK_SEND_QUEUE_SIZE") {
            config.transport.send_queue_size = val;
        }

        if let Some(val) = env_parse::<usize>("FRAMELINK_MAX_PACKET_LEN") {
            config.transport.max_packet_len = val;
        }

        if let Some(val) = env_parse::<u64>("FRAMELINK_READ_TIMEOUT_MS") {
            config.transport.read_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("FRAMELINK_WRITE_TIMEOUT_MS") {
            config.transport.write_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("FRAMELINK_KEEPALIVE_INTERVAL_MS") {
            config.client.keepalive_interval = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<bool>("FRAMELINK_COMPRESSION") {
            config.transport.compression_enabled = val;
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
            .map_err(|e| NetError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| NetError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.socket.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Ceiling on concurrently served connections, 0 disables shedding
    pub max_concurrent: usize,

    /// Bound on graceful shutdown before the timeout callback runs
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Whether set-real-ip frames from peers are honored
    pub accept_real_ip: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            max_concurrent: MAX_CONCURRENT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            accept_real_ip: false,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.max_concurrent > 1_000_000 {
            errors.push(format!(
                "Max concurrent connections very high: {} (maximum: 1,000,000)",
                self.max_concurrent
            ));
        }

        if self.shutdown_timeout.as_millis() < 10 {
            errors.push("Shutdown timeout too short (minimum: 10ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 300 {
            errors.push("Shutdown timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for a single dial attempt
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Whether to redial with backoff after the connection drops
    pub auto_reconnect: bool,

    /// Interval between keepalive pings, zero disables keepalive
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,

    /// Outbound queue capacity for RPC client connections
    pub rpc_send_queue_size: usize,

    /// Read deadline for RPC client connections
    #[serde(with = "duration_serde")]
    pub rpc_read_timeout: Duration,

    /// Deadline used by calls that do not pass their own
    #[serde(with = "duration_serde")]
    pub rpc_call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            connect_timeout: timeout::CONNECT_TIMEOUT,
            auto_reconnect: true,
            keepalive_interval: timeout::KEEPALIVE_INTERVAL,
            rpc_send_queue_size: RPC_SEND_QUEUE_SIZE,
            rpc_read_timeout: timeout::RPC_READ_TIMEOUT,
            rpc_call_timeout: timeout::RPC_CALL_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: '127.0.0.1:8080')",
                self.address
            ));
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        }

        if !self.keepalive_interval.is_zero() && self.keepalive_interval.as_millis() < 100 {
            errors.push("Keepalive interval too short (minimum: 100ms)".to_string());
        }

        if self.rpc_send_queue_size == 0 {
            errors.push("RPC send queue size must be greater than 0".to_string());
        }

        if self.rpc_call_timeout.as_millis() < 1 {
            errors.push("RPC call timeout must be at least 1ms".to_string());
        }

        errors
    }
}

/// TCP socket options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm
    pub nodelay: bool,

    /// Enable SO_KEEPALIVE
    pub keepalive: bool,

    /// TCP keepalive idle period, used when `keepalive` is set
    #[serde(with = "duration_serde")]
    pub keepalive_period: Duration,

    /// SO_RCVBUF in bytes
    pub recv_buffer_size: usize,

    /// SO_SNDBUF in bytes
    pub send_buffer_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: true,
            keepalive_period: timeout::KEEPALIVE_INTERVAL,
            recv_buffer_size: SOCKET_BUFFER_SIZE,
            send_buffer_size: SOCKET_BUFFER_SIZE,
        }
    }
}

impl SocketConfig {
    /// Validate socket configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.recv_buffer_size == 0 {
            errors.push("Receive buffer size must be greater than 0".to_string());
        }
        if self.send_buffer_size == 0 {
            errors.push("Send buffer size must be greater than 0".to_string());
        }
        if self.keepalive && self.keepalive_period.as_secs() < 1 {
            errors.push("TCP keepalive period too short (minimum: 1s)".to_string());
        }

        errors
    }
}

/// Per-connection framing, queue and deadline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Outbound queue capacity
    pub send_queue_size: usize,

    /// Max accepted body length of a frame
    pub max_packet_len: usize,

    /// Deadline for receiving one frame
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,

    /// Deadline for writing one frame
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Whether the compression cipher is installed by default
    pub compression_enabled: bool,

    /// Compression algorithm
    #[serde(default)]
    pub compression_kind: CompressionKind,

    /// Bodies longer than this many bytes are compressed
    pub compression_threshold: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_queue_size: SEND_QUEUE_SIZE,
            max_packet_len: MAX_PACKET_LEN,
            read_timeout: timeout::READ_TIMEOUT,
            write_timeout: timeout::WRITE_TIMEOUT,
            compression_enabled: false,
            compression_kind: CompressionKind::default(),
            compression_threshold: COMPRESSION_THRESHOLD,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.send_queue_size == 0 {
            errors.push("Send queue size must be greater than 0".to_string());
        } else if self.send_queue_size > 1_000_000 {
            errors.push(format!(
                "Send queue size too large: {} (maximum: 1,000,000)",
                self.send_queue_size
            ));
        }

        if self.max_packet_len == 0 {
            errors.push("Max packet length cannot be 0".to_string());
        } else if self.max_packet_len > u32::MAX as usize {
            errors.push(format!(
                "Max packet length too large: {} bytes (body length is a u32)",
                self.max_packet_len
            ));
        }

        if self.read_timeout.as_millis() < 100 {
            errors.push("Read timeout too short (minimum: 100ms)".to_string());
        }

        if self.write_timeout.as_millis() < 10 {
            errors.push("Write timeout too short (minimum: 10ms)".to_string());
        }

        if self.compression_enabled && self.compression_threshold > self.max_packet_len {
            errors.push("Compression threshold cannot be larger than max packet length".to_string());
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

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("framelink"),
            log_level: Level::INFO,
            log_to_console: true,
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
