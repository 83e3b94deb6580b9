//! Transport Layer
//!
//! Byte-oriented channels owned exclusively by one link. Protocol framing
//! lives above this layer; a transport only moves bytes with a timeout.

pub mod mock;
pub mod serial;
pub mod tcp;
pub mod udp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::config::{TransportConfig, TransportKind};
use crate::error::{Result, TransportError};

pub use mock::{MockHandle, MockTransport};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Connection state for transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Transport is disconnected
    #[default]
    Disconnected,
    /// Transport is connected and ready
    Connected,
    /// Transport has encountered an error
    Error,
}

/// Transport statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Number of successful connections
    pub successful_connections: u64,
    /// Number of failed connections
    pub failed_connections: u64,
    /// Number of disconnections
    pub disconnections: u64,
    /// Last successful connection time
    pub last_connection: Option<SystemTime>,
    /// Current connection state
    pub connection_state: ConnectionState,
}

impl TransportStats {
    pub fn record_successful_connection(&mut self) {
        self.successful_connections += 1;
        self.last_connection = Some(SystemTime::now());
        self.connection_state = ConnectionState::Connected;
    }

    pub fn record_failed_connection(&mut self) {
        self.failed_connections += 1;
        self.connection_state = ConnectionState::Error;
    }

    pub fn record_disconnection(&mut self) {
        self.disconnections += 1;
        self.connection_state = ConnectionState::Disconnected;
    }

    pub fn record_bytes_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn record_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }
}

/// Core transport trait
///
/// Implementations are owned by exactly one link manager, which is why every
/// I/O method takes `&mut self`.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Transport kind
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint (port name or socket address)
    fn name(&self) -> &str;

    /// Open the port or connect the socket
    async fn connect(&mut self) -> Result<()>;

    /// Close the port or socket; closing a closed transport is a no-op
    async fn disconnect(&mut self) -> Result<()>;

    /// Write the whole buffer
    async fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Read whatever is available, waiting at most `timeout` for the first byte
    async fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Drop stale input left over from an earlier exchange
    async fn discard_input(&mut self) {}

    fn is_connected(&self) -> bool;

    fn stats(&self) -> TransportStats;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect().await
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        (**self).send(data).await
    }

    async fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).receive(buffer, timeout).await
    }

    async fn discard_input(&mut self) {
        (**self).discard_input().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }
}

/// Build the transport described by `config`
///
/// The transport is returned unconnected.
pub fn create_transport(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    config.validate()?;

    match config.kind {
        TransportKind::Serial => Ok(Box::new(SerialTransport::new(config.clone()))),
        TransportKind::Tcp => Ok(Box::new(TcpTransport::new(config.clone()))),
        TransportKind::Udp => Ok(Box::new(UdpTransport::new(config.clone()))),
        TransportKind::Bluetooth => Err(TransportError::Unsupported(format!(
            "bluetooth transport for '{}' is not available in this build",
            config.address
        ))),
    }
}

/// Hex dump used by transport debug logging
pub(crate) fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_transport_kinds() {
        let serial = create_transport(&TransportConfig::serial("/dev/ttyUSB0", 9600));
        assert!(matches!(serial, Ok(t) if t.kind() == TransportKind::Serial));

        let tcp = create_transport(&TransportConfig::tcp("127.0.0.1:502"));
        assert!(matches!(tcp, Ok(t) if t.kind() == TransportKind::Tcp && !t.is_connected()));

        let mut ble = TransportConfig::tcp("AA:BB:CC:DD:EE:FF");
        ble.kind = TransportKind::Bluetooth;
        assert!(matches!(
            create_transport(&ble),
            Err(TransportError::Unsupported(_))
        ));
    }

    #[test]
    fn test_create_transport_validates() {
        assert!(matches!(
            create_transport(&TransportConfig::tcp("no-port")),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex(&[0x01, 0x03, 0xAB]), "01 03 AB");
        assert_eq!(hex(&[]), "");
    }
}
