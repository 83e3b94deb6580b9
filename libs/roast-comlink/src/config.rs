//! Transport configuration
//!
//! Port settings consumed unchanged by the transport layer. A link is built
//! from one `TransportConfig` and keeps it until it is explicitly reconfigured.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Physical or logical channel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Tcp,
    Udp,
    Bluetooth,
}

impl TransportKind {
    /// Socket transports can be torn down and recreated between attempts
    pub fn is_socket(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Udp)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Bluetooth => write!(f, "bluetooth"),
        }
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(alias = "none", alias = "N")]
    None,
    #[serde(alias = "even", alias = "E")]
    Even,
    #[serde(alias = "odd", alias = "O")]
    Odd,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Channel kind
    pub kind: TransportKind,
    /// Port name ("/dev/ttyUSB0", "COM4") or "host:port"
    pub address: String,
    /// Baud rate (serial only)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    #[serde(default = "default_byte_size")]
    pub byte_size: u8,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1, 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Additional attempts after the first one fails
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Pause between attempts in milliseconds
    #[serde(default)]
    pub inter_command_delay_ms: u64,
    /// Close and reopen socket transports after a failed attempt
    #[serde(default)]
    pub reset_on_error: bool,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_byte_size() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    400
}

fn default_retry_count() -> u32 {
    1
}

impl TransportConfig {
    /// Serial port with default line settings
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            kind: TransportKind::Serial,
            address: port.into(),
            baud_rate,
            byte_size: default_byte_size(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
            retry_count: default_retry_count(),
            inter_command_delay_ms: 0,
            reset_on_error: false,
        }
    }

    /// TCP endpoint
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Tcp,
            address: address.into(),
            ..Self::serial("", default_baud_rate())
        }
    }

    /// UDP endpoint
    pub fn udp(address: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Udp,
            ..Self::tcp(address)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(TransportError::config("address cannot be empty"));
        }

        if self.timeout_ms == 0 {
            return Err(TransportError::config("timeout must be greater than zero"));
        }

        match self.kind {
            TransportKind::Serial => {
                if self.baud_rate == 0 {
                    return Err(TransportError::config("baud rate must be greater than zero"));
                }
                if ![5, 6, 7, 8].contains(&self.byte_size) {
                    return Err(TransportError::config("byte size must be 5, 6, 7, or 8"));
                }
                if ![1, 2].contains(&self.stop_bits) {
                    return Err(TransportError::config("stop bits must be 1 or 2"));
                }
            },
            TransportKind::Tcp | TransportKind::Udp => {
                if !self.address.contains(':') {
                    return Err(TransportError::config(format!(
                        "socket address '{}' must be host:port",
                        self.address
                    )));
                }
            },
            TransportKind::Bluetooth => {},
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"kind": "serial", "address": "/dev/ttyUSB0"}"#).unwrap();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.byte_size, 8);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, 1);
        assert_eq!(config.timeout(), Duration::from_millis(400));
        assert_eq!(config.retry_count, 1);
        assert!(!config.reset_on_error);
    }

    #[test]
    fn test_parity_aliases() {
        let config: TransportConfig = serde_json::from_str(
            r#"{"kind": "serial", "address": "COM4", "parity": "E", "baud_rate": 19200}"#,
        )
        .unwrap();
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.baud_rate, 19200);
    }

    #[test]
    fn test_validate() {
        assert!(TransportConfig::serial("/dev/ttyUSB0", 9600).validate().is_ok());
        assert!(TransportConfig::tcp("192.168.1.10:502").validate().is_ok());
        assert!(TransportConfig::tcp("192.168.1.10").validate().is_err());
        assert!(TransportConfig::serial("", 9600).validate().is_err());

        let mut config = TransportConfig::serial("/dev/ttyUSB0", 9600);
        config.stop_bits = 3;
        assert!(config.validate().is_err());

        let config = TransportConfig::udp("10.0.0.5:502").with_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_socket_kinds() {
        assert!(TransportKind::Tcp.is_socket());
        assert!(TransportKind::Udp.is_socket());
        assert!(!TransportKind::Serial.is_socket());
        assert_eq!(TransportConfig::udp("h:1").kind, TransportKind::Udp);
    }
}
