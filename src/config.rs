//! # Configuration Management
//!
//! Centralized configuration for a wearable link.
//!
//! One [`LinkConfig`] describes a single connection: which wire format to
//! speak, which side of the handshake to play, and every timing bound the
//! link enforces (handshake, chunk acknowledgement, chunk inactivity,
//! request timeouts).
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`WEARABLE_LINK_*`)
//!
//! All durations are expressed in milliseconds in TOML.

use crate::core::codec::WireFormatKind;
use crate::error::{ProtocolError, Result};
use crate::protocol::session::{AuthMode, Role};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::{warn, Level};

/// Largest frame payload either wire format will carry (also the max packet
/// size announced during session configuration)
pub const MAX_FRAME_PAYLOAD: usize = 0xFC00;

/// Default per-write payload limit (BLE ATT MTU 247 minus the ATT header)
pub const DEFAULT_MTU: usize = 244;

/// Smallest MTU that still fits every chunk control message
pub const MIN_MTU: usize = 20;

/// Prefix of validation entries that are advisories rather than errors
pub const WARNING_PREFIX: &str = "WARNING:";

/// Main link configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LinkConfig {
    /// Framing and transport settings
    #[serde(default)]
    pub link: ConnectionConfig,

    /// Handshake and encryption settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Chunked transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Request/response dispatcher settings
    #[serde(default)]
    pub requests: RequestConfig,

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

        if let Ok(format) = std::env::var("WEARABLE_LINK_WIRE_FORMAT") {
            config.link.wire_format = match format.to_ascii_lowercase().as_str() {
                "legacy" => WireFormatKind::Legacy,
                "crc16" => WireFormatKind::Crc16,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Unknown wire format in WEARABLE_LINK_WIRE_FORMAT: '{other}'"
                    )))
                }
            };
        }

        if let Ok(role) = std::env::var("WEARABLE_LINK_ROLE") {
            config.link.role = match role.to_ascii_lowercase().as_str() {
                "initiator" => Role::Initiator,
                "responder" => Role::Responder,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Unknown role in WEARABLE_LINK_ROLE: '{other}'"
                    )))
                }
            };
        }

        if let Ok(mtu) = std::env::var("WEARABLE_LINK_MTU") {
            if let Ok(val) = mtu.parse::<usize>() {
                config.link.mtu = val;
            }
        }

        if let Ok(timeout) = std::env::var("WEARABLE_LINK_SEND_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.link.send_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("WEARABLE_LINK_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.session.handshake_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(mode) = std::env::var("WEARABLE_LINK_AUTH_MODE") {
            config.session.auth_mode = match mode.to_ascii_lowercase().as_str() {
                "encrypted" => AuthMode::Encrypted,
                "plaintext" => AuthMode::Plaintext,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Unknown auth mode in WEARABLE_LINK_AUTH_MODE: '{other}'"
                    )))
                }
            };
        }

        if let Ok(timeout) = std::env::var("WEARABLE_LINK_REQUEST_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.requests.default_timeout = Duration::from_millis(val);
            }
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

        errors.extend(self.link.validate());
        errors.extend(self.session.validate());
        errors.extend(self.transfer.validate());
        errors.extend(self.requests.validate());
        errors.extend(self.logging.validate());

        // Cross-section: the chunk receiver must give up before a request waiting on it does
        if self.requests.default_timeout < self.transfer.chunk_inactivity_timeout {
            errors.push(format!(
                "Request timeout ({}ms) shorter than chunk inactivity timeout ({}ms)",
                self.requests.default_timeout.as_millis(),
                self.transfer.chunk_inactivity_timeout.as_millis()
            ));
        }

        errors
    }

    /// Reject configurations a link cannot run with. Advisory entries
    /// (see [`WARNING_PREFIX`]) are logged instead of rejected.
    pub fn ensure_usable(&self) -> Result<()> {
        let (advisories, errors): (Vec<String>, Vec<String>) = self
            .validate()
            .into_iter()
            .partition(|entry| entry.starts_with(WARNING_PREFIX));
        for advisory in &advisories {
            warn!("{advisory}");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration rejected:\n  - {}",
                errors.join("\n  - ")
            )))
        }
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

/// Framing and transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Wire format spoken on this connection
    pub wire_format: WireFormatKind,

    /// Which side of the handshake this endpoint plays
    pub role: Role,

    /// Largest frame payload sent in one transport write
    pub mtu: usize,

    /// Largest declared payload accepted by the decoder
    pub max_frame_payload: usize,

    /// Bound on a single transport write
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// Ask the peer to acknowledge every Data frame
    #[serde(default)]
    pub request_acks: bool,

    /// Capacity of the link event channel
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormatKind::default(),
            role: Role::Initiator,
            mtu: DEFAULT_MTU,
            max_frame_payload: MAX_FRAME_PAYLOAD,
            send_timeout: timeout::SEND_TIMEOUT,
            request_acks: false,
            event_buffer: 64,
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.mtu < MIN_MTU {
            errors.push(format!("MTU too small: {} (minimum: {MIN_MTU})", self.mtu));
        } else if self.mtu > self.max_frame_payload {
            errors.push(format!(
                "MTU ({}) larger than max frame payload ({})",
                self.mtu, self.max_frame_payload
            ));
        }

        if self.max_frame_payload == 0 {
            errors.push("Max frame payload cannot be 0".to_string());
        } else if self.max_frame_payload > MAX_FRAME_PAYLOAD {
            errors.push(format!(
                "Max frame payload too large: {} (maximum: {MAX_FRAME_PAYLOAD})",
                self.max_frame_payload
            ));
        }

        if self.send_timeout.as_millis() < 10 {
            errors.push("Send timeout too short (minimum: 10ms)".to_string());
        } else if self.send_timeout.as_secs() > 60 {
            errors.push("Send timeout too long (maximum: 60s)".to_string());
        }

        if self.event_buffer == 0 {
            errors.push("Event buffer must be greater than 0".to_string());
        }

        errors
    }
}

/// Secure session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Encrypted handshake or plaintext bootstrap
    pub auth_mode: AuthMode,

    /// Bound on each handshake step (including session configuration)
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Consecutive integrity failures before the session is reported degraded
    pub integrity_failure_threshold: u32,

    /// Human-readable name sent to the peer during the handshake
    pub device_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_mode: AuthMode::Encrypted,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            integrity_failure_threshold: 3,
            device_name: String::from("wearable-link"),
        }
    }
}

impl SessionConfig {
    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 120 {
            errors.push("Handshake timeout too long (maximum: 120s)".to_string());
        }

        if self.integrity_failure_threshold == 0 {
            errors.push("Integrity failure threshold must be greater than 0".to_string());
        }

        if self.device_name.is_empty() {
            errors.push("Device name cannot be empty".to_string());
        } else if self.device_name.len() > 64 {
            errors.push(format!(
                "Device name too long: {} characters (maximum: 64)",
                self.device_name.len()
            ));
        }

        if self.auth_mode == AuthMode::Plaintext {
            errors.push(format!(
                "{WARNING_PREFIX} Plaintext bootstrap disables encryption - only for devices that require it"
            ));
        }

        errors
    }
}

/// Chunked transfer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    /// Silence on an inbound transfer before missing chunks are requested
    #[serde(with = "duration_serde")]
    pub chunk_inactivity_timeout: Duration,

    /// Wait for start-ack / end-ack on an outbound transfer
    #[serde(with = "duration_serde")]
    pub chunk_ack_timeout: Duration,

    /// Missing-chunk requests per inbound transfer before it is abandoned
    pub max_missing_requests: u32,

    /// Restarts of an outbound transfer before it is abandoned
    pub max_transfer_restarts: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_inactivity_timeout: timeout::CHUNK_INACTIVITY_TIMEOUT,
            chunk_ack_timeout: timeout::CHUNK_ACK_TIMEOUT,
            max_missing_requests: 3,
            max_transfer_restarts: 2,
        }
    }
}

impl TransferConfig {
    /// Validate transfer configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.chunk_inactivity_timeout.as_millis() < 50 {
            errors.push("Chunk inactivity timeout too short (minimum: 50ms)".to_string());
        }

        if self.chunk_ack_timeout.as_millis() < 50 {
            errors.push("Chunk ack timeout too short (minimum: 50ms)".to_string());
        }

        // The sender must not restart before the receiver had a chance to ask for gaps
        if self.chunk_ack_timeout <= self.chunk_inactivity_timeout {
            errors.push(format!(
                "Chunk ack timeout ({}ms) must exceed chunk inactivity timeout ({}ms)",
                self.chunk_ack_timeout.as_millis(),
                self.chunk_inactivity_timeout.as_millis()
            ));
        }

        if self.max_missing_requests > 16 {
            errors.push(format!(
                "Max missing requests too high: {} (maximum: 16)",
                self.max_missing_requests
            ));
        }

        if self.max_transfer_restarts > 16 {
            errors.push(format!(
                "Max transfer restarts too high: {} (maximum: 16)",
                self.max_transfer_restarts
            ));
        }

        errors
    }
}

/// Request/response configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestConfig {
    /// Timeout applied to handle requests that do not set their own
    #[serde(with = "duration_serde")]
    pub default_timeout: Duration,

    /// Consecutive send failures before the lifecycle owner is notified
    pub send_failure_threshold: u32,

    /// Capacity of the handle command queue
    pub command_buffer: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout: timeout::REQUEST_TIMEOUT,
            send_failure_threshold: 3,
            command_buffer: 32,
        }
    }
}

impl RequestConfig {
    /// Validate request configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.default_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        } else if self.default_timeout.as_secs() > 600 {
            errors.push("Request timeout too long (maximum: 600s)".to_string());
        }

        if self.send_failure_threshold == 0 {
            errors.push("Send failure threshold must be greater than 0".to_string());
        }

        if self.command_buffer == 0 {
            errors.push("Command buffer must be greater than 0".to_string());
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

    /// Extra filter directives (e.g. `wearable_link::protocol=trace`)
    #[serde(default)]
    pub filter: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("wearable-link"),
            log_level: Level::INFO,
            filter: None,
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

        if let Some(filter) = &self.filter {
            if filter.trim().is_empty() {
                errors.push("Log filter cannot be blank when set".to_string());
            }
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
