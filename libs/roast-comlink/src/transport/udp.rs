//! UDP Transport Implementation
//!
//! A connected datagram socket; each `receive` returns at most one datagram.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::{hex, Transport, TransportStats};
use crate::config::{TransportConfig, TransportKind};
use crate::error::{Result, TransportError};

#[derive(Debug)]
pub struct UdpTransport {
    config: TransportConfig,
    socket: Option<UdpSocket>,
    stats: TransportStats,
}

impl UdpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            socket: None,
            stats: TransportStats::default(),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn name(&self) -> &str {
        &self.config.address
    }

    async fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let open = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&self.config.address).await?;
            Ok::<_, std::io::Error>(socket)
        };

        match open.await {
            Ok(socket) => {
                self.socket = Some(socket);
                self.stats.record_successful_connection();
                info!("UDP socket bound for {}", self.config.address);
                Ok(())
            },
            Err(e) => {
                let msg = format!("Failed to open UDP socket to {}: {e}", self.config.address);
                error!("{msg}");
                self.stats.record_failed_connection();
                Err(TransportError::PortUnavailable(msg))
            },
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.socket.take().is_some() {
            self.stats.record_disconnection();
            info!("Closed UDP socket for {}", self.config.address);
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        let sent = socket.send(data).await?;
        self.stats.record_bytes_sent(sent);
        debug!(hex_data = %hex(data), length = sent, direction = "send", "[UDP] Raw packet");
        Ok(sent)
    }

    async fn receive(&mut self, buffer: &mut [u8], wait: Duration) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;

        match timeout(wait, socket.recv(buffer)).await {
            Ok(Ok(read)) => {
                self.stats.record_bytes_received(read);
                debug!(hex_data = %hex(&buffer[..read]), length = read, direction = "recv", "[UDP] Raw packet");
                Ok(read)
            },
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::timeout(format!("no datagram within {wait:?}"))),
        }
    }

    async fn discard_input(&mut self) {
        if let Some(socket) = self.socket.as_ref() {
            let mut scratch = [0u8; 512];
            while socket.try_recv(&mut scratch).is_ok() {}
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
