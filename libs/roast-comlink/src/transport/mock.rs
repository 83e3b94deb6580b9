//! Mock Transport for Testing
//!
//! Scriptable transport for exercising protocol and link logic without
//! hardware. Replies come from a FIFO of scripted frames or, when the queue
//! is empty, from an optional responder closure that plays the device.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{hex, Transport, TransportStats};
use crate::config::TransportKind;
use crate::error::{Result, TransportError};

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Scripted reply for the next request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Deliver these bytes
    Bytes(Vec<u8>),
    /// Stay silent so the reader times out
    Silence,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    fail_connect: bool,
    replies: VecDeque<MockReply>,
    responder: Option<Responder>,
    pending: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    chunk_size: Option<usize>,
    connects: u32,
    disconnects: u32,
    stats: TransportStats,
}

impl fmt::Debug for MockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockState")
            .field("connected", &self.connected)
            .field("replies", &self.replies.len())
            .field("responder", &self.responder.is_some())
            .field("pending", &self.pending.len())
            .field("sent", &self.sent.len())
            .finish()
    }
}

/// Test-side handle onto a `MockTransport`
///
/// Stays valid after the transport is moved into a link manager.
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Queue a reply for the next request
    pub fn push_reply(&self, reply: Vec<u8>) {
        self.state.lock().replies.push_back(MockReply::Bytes(reply));
    }

    /// Queue a silent (timed out) exchange
    pub fn push_silence(&self) {
        self.state.lock().replies.push_back(MockReply::Silence);
    }

    /// Answer every unscripted request with `responder`
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    pub fn clear_responder(&self) {
        self.state.lock().responder = None;
    }

    /// Deliver replies in pieces of at most `size` bytes per read
    pub fn set_chunk_size(&self, size: usize) {
        self.state.lock().chunk_size = Some(size.max(1));
    }

    /// Make the next `connect` calls fail
    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Act as if the peer closed the connection
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        if state.connected {
            state.connected = false;
            state.pending.clear();
            state.stats.record_disconnection();
        }
    }

    /// Every frame written so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn disconnect_count(&self) -> u32 {
        self.state.lock().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

/// Mock transport implementation
#[derive(Debug)]
pub struct MockTransport {
    name: String,
    kind: TransportKind,
    handle: MockHandle,
}

impl MockTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TransportKind::Serial,
            handle: MockHandle::default(),
        }
    }

    /// Report a different kind, e.g. `Tcp` to exercise socket resets
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.handle.state.lock();
        if state.fail_connect {
            state.stats.record_failed_connection();
            return Err(TransportError::port_unavailable(format!(
                "{} refused to open",
                self.name
            )));
        }
        if !state.connected {
            state.connected = true;
            state.connects += 1;
            state.stats.record_successful_connection();
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.handle.state.lock();
        if state.connected {
            state.connected = false;
            state.disconnects += 1;
            state.pending.clear();
            state.stats.record_disconnection();
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.handle.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }

        debug!(hex_data = %hex(data), "[Mock] send");
        state.sent.push(data.to_vec());
        state.stats.record_bytes_sent(data.len());

        let reply = match state.replies.pop_front() {
            Some(MockReply::Bytes(bytes)) => Some(bytes),
            Some(MockReply::Silence) => None,
            None => state.responder.as_mut().and_then(|respond| respond(data)),
        };
        if let Some(bytes) = reply {
            state.pending.extend(bytes);
        }
        Ok(data.len())
    }

    async fn receive(&mut self, buffer: &mut [u8], wait: Duration) -> Result<usize> {
        let mut state = self.handle.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.pending.is_empty() {
            return Err(TransportError::timeout(format!("no data within {wait:?}")));
        }

        let limit = state.chunk_size.unwrap_or(usize::MAX).min(buffer.len());
        let mut read = 0;
        while read < limit {
            match state.pending.pop_front() {
                Some(byte) => {
                    buffer[read] = byte;
                    read += 1;
                },
                None => break,
            }
        }
        state.stats.record_bytes_received(read);
        Ok(read)
    }

    async fn discard_input(&mut self) {
        self.handle.state.lock().pending.clear();
    }

    fn is_connected(&self) -> bool {
        self.handle.state.lock().connected
    }

    fn stats(&self) -> TransportStats {
        self.handle.state.lock().stats.clone()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_before_responder() {
        let mut transport = MockTransport::new("mock");
        let handle = transport.handle();
        handle.push_reply(vec![0x01, 0x02]);
        handle.set_responder(|request| Some(request.iter().rev().copied().collect()));

        transport.connect().await.unwrap();
        let mut buf = [0u8; 8];

        transport.send(&[0xAA]).await.unwrap();
        let n = transport
            .receive(&mut buf, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x02]);

        transport.send(&[0x10, 0x20]).await.unwrap();
        let n = transport
            .receive(&mut buf, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0x20, 0x10]);
        assert_eq!(handle.sent(), vec![vec![0xAA], vec![0x10, 0x20]]);
    }

    #[tokio::test]
    async fn test_silence_times_out() {
        let mut transport = MockTransport::new("mock");
        let handle = transport.handle();
        handle.push_silence();
        transport.connect().await.unwrap();

        transport.send(&[0x01]).await.unwrap();
        let mut buf = [0u8; 8];
        let result = transport.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_chunked_delivery() {
        let mut transport = MockTransport::new("mock");
        let handle = transport.handle();
        handle.set_chunk_size(2);
        handle.push_reply(vec![1, 2, 3, 4, 5]);
        transport.connect().await.unwrap();
        transport.send(&[0]).await.unwrap();

        let mut buf = [0u8; 8];
        let mut received = Vec::new();
        while let Ok(n) = transport.receive(&mut buf, Duration::from_millis(1)).await {
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_connect_failure_and_counts() {
        let mut transport = MockTransport::new("mock").with_kind(TransportKind::Tcp);
        let handle = transport.handle();
        handle.fail_connect(true);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::PortUnavailable(_))
        ));

        handle.fail_connect(false);
        transport.connect().await.unwrap();
        transport.disconnect().await.unwrap();
        transport.connect().await.unwrap();
        assert_eq!(handle.connect_count(), 2);
        assert_eq!(handle.disconnect_count(), 1);
        assert_eq!(transport.kind(), TransportKind::Tcp);
    }

    #[tokio::test]
    async fn test_dropped_connection_refuses_io() {
        let mut transport = MockTransport::new("mock").with_kind(TransportKind::Tcp);
        let handle = transport.handle();
        transport.connect().await.unwrap();

        handle.drop_connection();
        assert!(!transport.is_connected());
        let err = transport.send(&[1]).await.unwrap_err();
        assert!(err.needs_reconnect());
        assert_eq!(handle.disconnect_count(), 0);

        transport.connect().await.unwrap();
        assert_eq!(handle.connect_count(), 2);
    }
}
