//! TCP Transport Implementation

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{hex, Transport, TransportStats};
use crate::config::{TransportConfig, TransportKind};
use crate::error::{Result, TransportError};

/// TCP client transport
#[derive(Debug)]
pub struct TcpTransport {
    config: TransportConfig,
    stream: Option<TcpStream>,
    stats: TransportStats,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            stream: None,
            stats: TransportStats::default(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn name(&self) -> &str {
        &self.config.address
    }

    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        debug!("Connecting to {}", self.config.address);

        match timeout(
            self.config.timeout(),
            TcpStream::connect(&self.config.address),
        )
        .await
        {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY on {}: {e}", self.config.address);
                }
                self.stream = Some(stream);
                self.stats.record_successful_connection();
                info!("Connected to {}", self.config.address);
                Ok(())
            },
            Ok(Err(e)) => {
                let msg = format!("Failed to connect to {}: {e}", self.config.address);
                error!("{msg}");
                self.stats.record_failed_connection();
                Err(TransportError::PortUnavailable(msg))
            },
            Err(_) => {
                let msg = format!(
                    "Connection to {} timed out after {:?}",
                    self.config.address,
                    self.config.timeout()
                );
                error!("{msg}");
                self.stats.record_failed_connection();
                Err(TransportError::PortUnavailable(msg))
            },
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone
            let _ = stream.shutdown().await;
            self.stats.record_disconnection();
            info!("Disconnected from {}", self.config.address);
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        match timeout(self.config.timeout(), stream.write_all(data)).await {
            Ok(Ok(())) => {
                self.stats.record_bytes_sent(data.len());
                debug!(hex_data = %hex(data), length = data.len(), direction = "send", "[TCP] Raw packet");
                Ok(data.len())
            },
            Ok(Err(e)) => {
                error!("TCP write to {} failed: {e}", self.config.address);
                self.stream = None;
                self.stats.record_disconnection();
                Err(e.into())
            },
            Err(_) => Err(TransportError::timeout(format!(
                "write timed out after {:?}",
                self.config.timeout()
            ))),
        }
    }

    async fn receive(&mut self, buffer: &mut [u8], wait: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        match timeout(wait, stream.read(buffer)).await {
            Ok(Ok(0)) => {
                warn!("Connection closed by {}", self.config.address);
                self.stream = None;
                self.stats.record_disconnection();
                Err(TransportError::Closed(self.config.address.clone()))
            },
            Ok(Ok(read)) => {
                self.stats.record_bytes_received(read);
                debug!(hex_data = %hex(&buffer[..read]), length = read, direction = "recv", "[TCP] Raw packet");
                Ok(read)
            },
            Ok(Err(e)) => {
                error!("TCP read from {} failed: {e}", self.config.address);
                self.stream = None;
                self.stats.record_disconnection();
                Err(e.into())
            },
            Err(_) => Err(TransportError::timeout(format!("no data within {wait:?}"))),
        }
    }

    async fn discard_input(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut scratch = [0u8; 256];
        let mut closed = false;
        // Drain late replies from an earlier, timed-out exchange
        while let Ok(read) = stream.try_read(&mut scratch) {
            if read == 0 {
                closed = true;
                break;
            }
            debug!("Discarded {read} stale bytes from {}", self.config.address);
        }
        if closed {
            warn!("Connection closed by {}", self.config.address);
            self.stream = None;
            self.stats.record_disconnection();
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut transport = TcpTransport::new(TransportConfig::tcp(address));
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        transport.send(&[0x00, 0x01, 0x02]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = transport
            .receive(&mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0x00, 0x01, 0x02]);

        let stats = transport.stats();
        assert_eq!(stats.bytes_sent, 3);
        assert_eq!(stats.bytes_received, 3);

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_refused_connection_is_unavailable() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut transport = TcpTransport::new(TransportConfig::tcp(address));
        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::PortUnavailable(_))));
    }
}
