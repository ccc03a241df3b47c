//! Bridge configuration using Figment
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `GPIB_BRIDGE_` (nested keys separated by `__`)
//! 2. A TOML file (default: `config/gpib_bridge.toml`, optional)
//! 3. Built-in defaults matching the Prologix adapter and the delay-generator test
//!
//! ```text
//! GPIB_BRIDGE_CONNECTION__PORT_NAME=/dev/ttyUSB0
//! GPIB_BRIDGE_CONNECTION__TIMEOUT_MS=750
//! GPIB_BRIDGE_ADAPTER__GPIB_ADDRESS=15
//! GPIB_BRIDGE_SEQUENCE__STEPS=4
//! ```
//!
//! Nothing is ever written back; configuration is in-memory only.

use crate::protocol::escape::encode_ascii;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default location of the optional configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/gpib_bridge.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "GPIB_BRIDGE_";

/// Highest primary address on a GPIB bus.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment failed to read or extract the configuration.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// The configuration parsed but holds an invalid value.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link settings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Prologix adapter settings
    #[serde(default)]
    pub adapter: AdapterConfig,
    /// Test sequence parameters
    #[serde(default)]
    pub sequence: SequenceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Parity modes for serial communication
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Handshake (flow control) modes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Handshake {
    /// No flow control
    None,
    /// XON/XOFF software flow control
    XonXoff,
    /// RTS/CTS hardware flow control
    #[default]
    RequestToSend,
}

/// Character encoding used for status text
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LineEncoding {
    /// 7-bit ASCII; anything above 0x7F is shown as `?`
    #[default]
    Ascii,
    /// UTF-8, invalid sequences replaced
    Utf8,
}

impl LineEncoding {
    /// Encode outgoing text. ASCII maps every character to one byte, `?` when it has
    /// no ASCII form.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            LineEncoding::Ascii => encode_ascii(text),
            LineEncoding::Utf8 => text.as_bytes().to_vec(),
        }
    }
}

/// Serial link configuration
///
/// The Prologix adapter ignores the baud rate, but the remaining settings must match
/// what its USB-serial firmware expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Serial device (e.g. "/dev/ttyUSB0", "COM3"); unset until a port is chosen
    #[serde(default)]
    pub port_name: Option<String>,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity setting
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Flow control mode
    #[serde(default)]
    pub handshake: Handshake,
    /// Assert RTS after opening
    #[serde(default = "default_true")]
    pub rts_enable: bool,
    /// Assert DTR after opening
    #[serde(default = "default_true")]
    pub dtr_enable: bool,
    /// Encoding used to turn received bytes into status text
    #[serde(default)]
    pub encoding: LineEncoding,
    /// Read and write timeout in milliseconds (applied identically to both)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Drop NUL bytes from received text
    #[serde(default)]
    pub discard_null: bool,
    /// Byte substituted for characters received with a parity error (0 = none)
    #[serde(default)]
    pub parity_replace: u8,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            handshake: Handshake::RequestToSend,
            rts_enable: true,
            dtr_enable: true,
            encoding: LineEncoding::Ascii,
            timeout_ms: default_timeout_ms(),
            discard_null: false,
            parity_replace: 0,
        }
    }
}

impl ConnectionConfig {
    /// Read/write timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Copy of this config pointed at a different port.
    pub fn with_port(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = Some(port_name.into());
        self
    }

    /// Decode received bytes into status text according to the configured encoding.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let filtered = bytes
            .iter()
            .copied()
            .filter(|b| !(self.discard_null && *b == 0));
        match self.encoding {
            LineEncoding::Ascii => filtered
                .map(|b| if b.is_ascii() { b as char } else { '?' })
                .collect(),
            LineEncoding::Utf8 => String::from_utf8_lossy(&filtered.collect::<Vec<_>>()).into_owned(),
        }
    }

    /// Check the values that would otherwise fail deep inside the transport.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timeout_ms must be a positive number of milliseconds".to_string(),
            ));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid data_bits {}. Must be 5-8",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid stop_bits {}. Must be 1 or 2",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

/// Prologix adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    /// GPIB primary address of the instrument; when set, `++addr` joins the bring-up
    #[serde(default)]
    pub gpib_address: Option<u8>,
    /// Interval between receive polls in milliseconds
    #[serde(default = "default_receive_poll_ms")]
    pub receive_poll_ms: u64,
    /// Pause before each status line is applied on the owning context (0 = one yield)
    #[serde(default = "default_status_settle_ms")]
    pub status_settle_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            gpib_address: None,
            receive_poll_ms: default_receive_poll_ms(),
            status_settle_ms: default_status_settle_ms(),
        }
    }
}

impl AdapterConfig {
    /// Receive poll interval as a `Duration`.
    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    /// Status settle delay as a `Duration`.
    pub fn status_settle(&self) -> Duration {
        Duration::from_millis(self.status_settle_ms)
    }
}

/// Delay-generator test sequence parameters
///
/// Even steps program `even_delay`, odd steps `odd_delay` (seconds), on
/// `delay_channel` relative to `reference_channel`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceConfig {
    /// Number of write/read steps
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// Delay for even-numbered steps, in seconds
    #[serde(default = "default_even_delay")]
    pub even_delay: f64,
    /// Delay for odd-numbered steps, in seconds
    #[serde(default = "default_odd_delay")]
    pub odd_delay: f64,
    /// Channel whose delay is programmed
    #[serde(default = "default_delay_channel")]
    pub delay_channel: u8,
    /// Channel the delay is measured from
    #[serde(default = "default_reference_channel")]
    pub reference_channel: u8,
    /// Pause between `++read` and reading the reply, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            even_delay: default_even_delay(),
            odd_delay: default_odd_delay(),
            delay_channel: default_delay_channel(),
            reference_channel: default_reference_channel(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl SequenceConfig {
    /// Settling interval as a `Duration`.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_receive_poll_ms() -> u64 {
    20
}

fn default_status_settle_ms() -> u64 {
    0
}

fn default_steps() -> usize {
    10
}

fn default_even_delay() -> f64 {
    1.5e-5
}

fn default_odd_delay() -> f64 {
    2.5e-3
}

fn default_delay_channel() -> u8 {
    2
}

fn default_reference_channel() -> u8 {
    1
}

fn default_settle_ms() -> u64 {
    100
}

impl BridgeConfig {
    /// Load configuration from the default file location and environment variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment overrides still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.connection.validate()?;

        if let Some(address) = self.adapter.gpib_address {
            if address > MAX_GPIB_ADDRESS {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid gpib_address {}. Must be 0-{}",
                    address, MAX_GPIB_ADDRESS
                )));
            }
        }
        if self.adapter.receive_poll_ms == 0 {
            return Err(ConfigError::ValidationError(
                "receive_poll_ms must be positive".to_string(),
            ));
        }

        if self.sequence.steps == 0 {
            return Err(ConfigError::ValidationError(
                "sequence steps must be positive".to_string(),
            ));
        }
        if self.sequence.settle_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sequence settle_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
