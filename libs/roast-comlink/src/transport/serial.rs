//! Serial Transport Implementation
//!
//! RS232/RS485 ports through tokio-serial.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use super::{hex, Transport, TransportStats};
use crate::config::{Parity, TransportConfig, TransportKind};
use crate::error::{Result, TransportError};

/// Serial transport implementation
#[derive(Debug)]
pub struct SerialTransport {
    config: TransportConfig,
    port: Option<SerialStream>,
    stats: TransportStats,
}

impl SerialTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            port: None,
            stats: TransportStats::default(),
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.config.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        }
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.config.byte_size {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn name(&self) -> &str {
        &self.config.address
    }

    async fn connect(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        debug!("Opening serial port: {}", self.config.address);

        let builder = tokio_serial::new(&self.config.address, self.config.baud_rate)
            .data_bits(self.data_bits())
            .parity(self.parity())
            .stop_bits(self.stop_bits())
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(self.config.timeout());

        match builder.open_native_async() {
            Ok(port) => {
                #[cfg(unix)]
                let port = {
                    let mut port = port;
                    port.set_exclusive(false).map_err(|e| {
                        TransportError::io(format!("Failed to set exclusive mode: {e}"))
                    })?;
                    port
                };

                self.port = Some(port);
                self.stats.record_successful_connection();
                info!(
                    "Opened serial port {} ({} {}{}{})",
                    self.config.address,
                    self.config.baud_rate,
                    self.config.byte_size,
                    match self.config.parity {
                        Parity::None => 'N',
                        Parity::Even => 'E',
                        Parity::Odd => 'O',
                    },
                    self.config.stop_bits
                );
                Ok(())
            },
            Err(e) => {
                let msg = format!("Failed to open serial port {}: {e}", self.config.address);
                error!("{msg}");
                self.stats.record_failed_connection();
                Err(TransportError::PortUnavailable(msg))
            },
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            self.stats.record_disconnection();
            info!("Closed serial port: {}", self.config.address);
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        let write = async {
            port.write_all(data).await?;
            port.flush().await?;
            Ok::<_, std::io::Error>(data.len())
        };

        match timeout(self.config.timeout(), write).await {
            Ok(Ok(sent)) => {
                self.stats.record_bytes_sent(sent);
                debug!(hex_data = %hex(data), length = sent, direction = "send", "[Serial] Raw packet");
                Ok(sent)
            },
            Ok(Err(e)) => {
                error!("Serial write failed on {}: {e}", self.config.address);
                self.port = None;
                self.stats.record_disconnection();
                Err(e.into())
            },
            Err(_) => {
                warn!("Serial write timed out on {}", self.config.address);
                Err(TransportError::timeout(format!(
                    "write timed out after {:?}",
                    self.config.timeout()
                )))
            },
        }
    }

    async fn receive(&mut self, buffer: &mut [u8], wait: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        match timeout(wait, port.read(buffer)).await {
            Ok(Ok(read)) => {
                self.stats.record_bytes_received(read);
                debug!(hex_data = %hex(&buffer[..read]), length = read, direction = "recv", "[Serial] Raw packet");
                Ok(read)
            },
            Ok(Err(e)) => {
                error!("Serial read failed on {}: {e}", self.config.address);
                self.port = None;
                self.stats.record_disconnection();
                Err(e.into())
            },
            // Debug level, timeouts are routine on a polled bus
            Err(_) => {
                debug!("Serial read timed out after {wait:?}");
                Err(TransportError::timeout(format!("no data within {wait:?}")))
            },
        }
    }

    async fn discard_input(&mut self) {
        if let Some(port) = self.port.as_ref() {
            if let Err(e) = port.clear(tokio_serial::ClearBuffer::Input) {
                debug!("Failed to clear serial input buffer: {e}");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_settings_mapping() {
        let mut config = TransportConfig::serial("/dev/ttyS9", 19200);
        config.parity = Parity::Odd;
        config.byte_size = 7;
        config.stop_bits = 2;

        let transport = SerialTransport::new(config);
        assert_eq!(transport.parity(), tokio_serial::Parity::Odd);
        assert_eq!(transport.data_bits(), tokio_serial::DataBits::Seven);
        assert_eq!(transport.stop_bits(), tokio_serial::StopBits::Two);
        assert_eq!(transport.name(), "/dev/ttyS9");
    }

    #[tokio::test]
    async fn test_missing_port_is_unavailable() {
        let mut transport =
            SerialTransport::new(TransportConfig::serial("/dev/roast-no-such-port", 9600));
        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::PortUnavailable(_))));
        assert!(!transport.is_connected());
        assert_eq!(transport.stats().failed_connections, 1);
    }

    #[tokio::test]
    async fn test_io_requires_connection() {
        let mut transport = SerialTransport::new(TransportConfig::serial("/dev/ttyS9", 9600));
        let mut buf = [0u8; 8];
        assert_eq!(
            transport.send(&[0x01]).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport.receive(&mut buf, Duration::from_millis(10)).await,
            Err(TransportError::NotConnected)
        );
    }
}
