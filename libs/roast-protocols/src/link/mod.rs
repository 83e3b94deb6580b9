//! Link Manager
//!
//! Owns one transport and its codec. Requests are serialized by a FIFO async
//! mutex so only one frame is ever outstanding on the wire; failed attempts
//! are retried on the injected clock and the link reports each change of
//! communication health exactly once.

mod retry;

pub use retry::{with_retries, RetryError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roast_comlink::{create_transport, Clock, Transport, TransportConfig, TransportStats};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, FrameStatus, Request, Response};
use crate::error::LinkError;
use crate::serial_cmd::SerialReply;

const READ_CHUNK: usize = 256;
const EVENT_CAPACITY: usize = 64;

/// Connection state of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Not opened yet, or shut down; the next request opens it
    Idle,
    Connected,
    /// Connection dropped after a successful open; the next attempt
    /// reconnects and a failed reconnect stays transient
    Lost,
    /// Opening failed; requests fail fast until `connect`/`reconfigure`
    Failed(String),
}

/// Health notifications, one per change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    CommunicationError { link: String, error: String },
    CommunicationResumed { link: String },
}

#[derive(Debug)]
struct LinkInner {
    transport: Option<Box<dyn Transport>>,
    codec: Codec,
    state: LinkState,
    config: TransportConfig,
}

/// Serialized request/response channel to one physical link
#[derive(Debug)]
pub struct LinkManager {
    name: String,
    family: &'static str,
    inner: Mutex<LinkInner>,
    clock: Arc<dyn Clock>,
    healthy: AtomicBool,
    events: broadcast::Sender<LinkEvent>,
    cancel: parking_lot::Mutex<CancellationToken>,
}

impl LinkManager {
    /// Link over the transport described by `config`
    ///
    /// Never fails: a transport that cannot be built leaves the link in
    /// the failed state, and every request reports `PortUnavailable`.
    pub fn new(
        name: impl Into<String>,
        config: TransportConfig,
        codec: Codec,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = name.into();
        let (transport, state) = match create_transport(&config) {
            Ok(transport) => (Some(transport), LinkState::Idle),
            Err(e) => {
                error!("Link {}: cannot create transport: {}", name, e);
                (None, LinkState::Failed(e.to_string()))
            },
        };
        Self::build(name, config, codec, transport, state, clock)
    }

    /// Link over a caller-supplied transport (mock or pre-built)
    pub fn with_transport(
        name: impl Into<String>,
        config: TransportConfig,
        codec: Codec,
        transport: Box<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::build(
            name.into(),
            config,
            codec,
            Some(transport),
            LinkState::Idle,
            clock,
        )
    }

    fn build(
        name: String,
        config: TransportConfig,
        codec: Codec,
        transport: Option<Box<dyn Transport>>,
        state: LinkState,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name,
            family: codec.family(),
            inner: Mutex::new(LinkInner {
                transport,
                codec,
                state,
                config,
            }),
            clock,
            healthy: AtomicBool::new(true),
            events,
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol family used in health log lines ("Modbus", "S7", ...)
    pub fn family(&self) -> &'static str {
        self.family
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// False between a communication error and the next success
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> LinkState {
        self.inner.lock().await.state.clone()
    }

    pub async fn transport_stats(&self) -> Option<TransportStats> {
        self.inner
            .lock()
            .await
            .transport
            .as_ref()
            .map(|transport| transport.stats())
    }

    /// Open the transport, clearing a previous failure or shutdown
    pub async fn connect(&self) -> Result<(), LinkError> {
        self.renew_cancel();
        let mut inner = self.inner.lock().await;
        if inner.state == LinkState::Connected {
            return Ok(());
        }
        let result = open(&self.name, &mut inner).await;
        self.record(&result);
        result
    }

    /// Replace the transport settings and reconnect
    pub async fn reconfigure(&self, config: TransportConfig) -> Result<(), LinkError> {
        self.renew_cancel();
        let mut inner = self.inner.lock().await;
        if let Some(transport) = inner.transport.as_mut() {
            let _ = transport.disconnect().await;
        }
        info!("Link {}: reconfigured to {}", self.name, config.address);
        inner.transport = None;
        inner.config = config;
        inner.state = LinkState::Idle;
        let result = open(&self.name, &mut inner).await;
        self.record(&result);
        result
    }

    /// Cancel any outstanding request and close the transport
    pub async fn shutdown(&self) {
        self.cancel.lock().cancel();
        let mut inner = self.inner.lock().await;
        if let Some(transport) = inner.transport.as_mut() {
            if let Err(e) = transport.disconnect().await {
                debug!("Link {}: disconnect on shutdown: {}", self.name, e);
            }
        }
        if matches!(inner.state, LinkState::Connected | LinkState::Lost) {
            inner.state = LinkState::Idle;
        }
        info!("Link {} shut down", self.name);
    }

    /// One request/reply exchange with bounded retries
    pub async fn request(&self, request: &Request) -> Result<Response, LinkError> {
        let cancel = self.cancel.lock().clone();
        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }

        let mut inner = tokio::select! {
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            guard = self.inner.lock() => guard,
        };

        let state = inner.state.clone();
        let result = match state {
            LinkState::Failed(reason) => Err(LinkError::PortUnavailable(reason)),
            LinkState::Idle => match open(&self.name, &mut inner).await {
                Ok(()) => self.attempt(&mut inner, request, &cancel).await,
                Err(e) => Err(e),
            },
            LinkState::Connected | LinkState::Lost => {
                self.attempt(&mut inner, request, &cancel).await
            },
        };

        self.record(&result);
        result
    }

    async fn attempt(
        &self,
        inner: &mut LinkInner,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Response, LinkError> {
        let retries = inner.config.retry_count;
        let delay = inner.config.inter_command_delay();
        let name = self.name.as_str();

        let outcome = with_retries(
            retries,
            delay,
            self.clock.as_ref(),
            inner,
            |err: &LinkError| err.is_retryable(),
            |inner, attempt| {
                let request = request.clone();
                let cancel = cancel.clone();
                let name = name.to_string();
                Box::pin(async move {
                    let reset = attempt > 1 && inner.config.reset_on_error && is_socket(inner);
                    if reset {
                        debug!("Link {}: resetting transport before attempt {}", name, attempt);
                    }
                    if reset || !transport_connected(inner) {
                        reconnect(&name, inner).await?;
                    }
                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(LinkError::Cancelled),
                        result = exchange(inner, &request) => result,
                    };
                    if let Err(LinkError::Transport(e)) = &result {
                        if e.needs_reconnect() {
                            warn!("Link {}: connection lost: {}", name, e);
                            inner.state = LinkState::Lost;
                        }
                    }
                    result
                })
            },
        )
        .await;

        outcome.map_err(|err| match err {
            RetryError::Exhausted { attempts, last } => LinkError::CommunicationFailed {
                attempts,
                last: Box::new(last),
            },
            RetryError::Aborted(err) => err,
        })
    }

    /// Update health from a request outcome, reporting transitions once
    fn record<T>(&self, result: &Result<T, LinkError>) {
        match result {
            Ok(_) => {
                if !self.healthy.swap(true, Ordering::SeqCst) {
                    info!("{} Communication Resumed", self.family);
                    let _ = self.events.send(LinkEvent::CommunicationResumed {
                        link: self.name.clone(),
                    });
                }
            },
            Err(LinkError::Cancelled | LinkError::UnsupportedRequest { .. }) => {},
            Err(err) => {
                if self.healthy.swap(false, Ordering::SeqCst) {
                    warn!("{} Communication Error on {}: {}", self.family, self.name, err);
                    let _ = self.events.send(LinkEvent::CommunicationError {
                        link: self.name.clone(),
                        error: err.to_string(),
                    });
                }
            },
        }
    }

    fn renew_cancel(&self) {
        let mut cancel = self.cancel.lock();
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
    }
}

fn is_socket(inner: &LinkInner) -> bool {
    inner
        .transport
        .as_ref()
        .is_some_and(|transport| transport.kind().is_socket())
}

fn transport_connected(inner: &LinkInner) -> bool {
    inner
        .transport
        .as_ref()
        .is_some_and(|transport| transport.is_connected())
}

/// Reopen a link that was connected before
///
/// Unlike `open`, failure leaves the link `Lost` rather than `Failed`: the
/// device was reachable once, so the outage is treated as transient.
async fn reconnect(name: &str, inner: &mut LinkInner) -> Result<(), LinkError> {
    if let Some(transport) = inner.transport.as_mut() {
        let _ = transport.disconnect().await;
    }
    match connect_transport(inner).await {
        Ok(()) => {
            info!("Link {} reconnected", name);
            inner.state = LinkState::Connected;
            Ok(())
        },
        Err(e) => {
            warn!("Link {}: reconnect failed: {}", name, e);
            inner.state = LinkState::Lost;
            Err(LinkError::Reconnect(e.to_string()))
        },
    }
}

/// Connect the transport and run the codec handshake
async fn open(name: &str, inner: &mut LinkInner) -> Result<(), LinkError> {
    match connect_transport(inner).await {
        Ok(()) => {
            info!("Link {} connected ({})", name, inner.codec.name());
            inner.state = LinkState::Connected;
            Ok(())
        },
        Err(e) => {
            error!("Link {}: {}", name, e);
            inner.state = LinkState::Failed(e.to_string());
            Err(match e {
                LinkError::PortUnavailable(_) => e,
                other => LinkError::PortUnavailable(other.to_string()),
            })
        },
    }
}

async fn connect_transport(inner: &mut LinkInner) -> Result<(), LinkError> {
    if inner.transport.is_none() {
        inner.transport = Some(create_transport(&inner.config)?);
    }
    let timeout = inner.config.timeout();
    let LinkInner {
        transport, codec, ..
    } = inner;
    let Some(transport) = transport.as_mut() else {
        return Err(LinkError::PortUnavailable("no transport".to_string()));
    };

    transport.connect().await?;
    for (step, frame) in codec.handshake().into_iter().enumerate() {
        transport.send(&frame).await?;
        let reply = read_frame(&mut **transport, timeout, |buf| codec.handshake_status(buf)).await?;
        codec.accept_handshake(step, &reply)?;
    }
    Ok(())
}

/// Send one encoded request and decode its reply
async fn exchange(inner: &mut LinkInner, request: &Request) -> Result<Response, LinkError> {
    let timeout = inner.config.timeout();
    let LinkInner {
        transport, codec, ..
    } = inner;
    let Some(transport) = transport.as_mut() else {
        return Err(LinkError::PortUnavailable("no transport".to_string()));
    };

    transport.discard_input().await;
    let frame = codec.encode(request)?;
    transport.send(&frame).await?;
    if !codec.expects_reply(request) {
        return Ok(Response::Serial(SerialReply::default()));
    }

    let reply =
        read_frame(&mut **transport, timeout, |buf| codec.frame_status(request, buf)).await?;
    Ok(codec.decode(request, &reply)?)
}

/// Read until `status` reports a complete frame or `timeout` elapses
///
/// A partial frame at the deadline is returned as-is so the decoder can name
/// what is wrong with it; silence is `LinkError::Timeout`.
async fn read_frame<F>(
    transport: &mut dyn Transport,
    timeout: Duration,
    status: F,
) -> Result<Vec<u8>, LinkError>
where
    F: Fn(&[u8]) -> FrameStatus,
{
    let deadline = Instant::now() + timeout;
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match transport.receive(&mut chunk, remaining).await {
            Ok(0) => continue,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if let FrameStatus::Complete(len) = status(&buffer) {
                    buffer.truncate(len);
                    return Ok(buffer);
                }
            },
            Err(roast_comlink::TransportError::Timeout(_)) => break,
            Err(e) => return Err(e.into()),
        }
    }

    if buffer.is_empty() {
        Err(LinkError::Timeout(timeout))
    } else {
        debug!("Incomplete frame at deadline: {} bytes", buffer.len());
        Ok(buffer)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::codec::Protocol;
    use crate::error::FrameError;
    use crate::modbus::{rtu, ModbusOp, ModbusRequest, ModbusResponse};
    use roast_comlink::{ManualClock, MockHandle, MockTransport};

    fn read_request() -> Request {
        Request::Modbus(ModbusRequest::new(
            1,
            ModbusOp::ReadHoldingRegisters {
                address: 0,
                count: 1,
            },
        ))
    }

    fn reply(value: u16) -> Vec<u8> {
        rtu::encode_response(1, 0x03, &ModbusResponse::Registers(vec![value]))
    }

    fn rtu_link(retries: u32, delay_ms: u64) -> (LinkManager, MockHandle, Arc<ManualClock>) {
        let mock = MockTransport::new("COM3");
        let handle = mock.handle();
        let clock = Arc::new(ManualClock::new());
        let mut config = TransportConfig::serial("COM3", 19200).with_retries(retries);
        config.inter_command_delay_ms = delay_ms;
        let link = LinkManager::with_transport(
            "meter",
            config,
            Protocol::ModbusRtu.codec(0, 0),
            Box::new(mock),
            clock.clone(),
        );
        (link, handle, clock)
    }

    #[tokio::test]
    async fn test_request_decodes_reply() {
        let (link, handle, _clock) = rtu_link(0, 0);
        handle.push_reply(reply(1452));

        let response = link.request(&read_request()).await.unwrap();
        assert_eq!(response, Response::Modbus(ModbusResponse::Registers(vec![1452])));
        assert_eq!(handle.sent_count(), 1);
        assert_eq!(link.state().await, LinkState::Connected);
    }

    #[tokio::test]
    async fn test_silence_retries_then_fails() {
        let (link, handle, clock) = rtu_link(2, 50);
        handle.push_silence();
        handle.push_silence();
        handle.push_silence();

        let err = link.request(&read_request()).await.unwrap_err();
        assert!(matches!(err, LinkError::CommunicationFailed { attempts: 3, .. }));
        assert!(matches!(err.root(), LinkError::Timeout(_)));
        assert_eq!(handle.sent_count(), 3);
        assert_eq!(clock.now(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_chunked_reply_is_reassembled() {
        let (link, handle, _clock) = rtu_link(0, 0);
        handle.set_chunk_size(2);
        handle.push_reply(reply(7));

        let response = link.request(&read_request()).await.unwrap();
        assert_eq!(response, Response::Modbus(ModbusResponse::Registers(vec![7])));
    }

    #[tokio::test]
    async fn test_truncated_reply_is_short_frame() {
        let (link, handle, _clock) = rtu_link(0, 0);
        let mut frame = reply(7);
        frame.truncate(4);
        handle.push_reply(frame);

        let err = link.request(&read_request()).await.unwrap_err();
        assert!(matches!(
            err.root(),
            LinkError::Frame(FrameError::ShortFrame { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_sticky() {
        let (link, handle, _clock) = rtu_link(3, 0);
        handle.fail_connect(true);

        let err = link.request(&read_request()).await.unwrap_err();
        assert!(matches!(err, LinkError::PortUnavailable(_)));
        let connects = handle.connect_count();

        // No reconnect attempt and no retries while failed
        handle.fail_connect(false);
        let err = link.request(&read_request()).await.unwrap_err();
        assert!(matches!(err, LinkError::PortUnavailable(_)));
        assert_eq!(handle.connect_count(), connects);
        assert_eq!(handle.sent_count(), 0);

        link.connect().await.unwrap();
        handle.push_reply(reply(1));
        assert!(link.request(&read_request()).await.is_ok());
        assert!(link.is_healthy());
    }

    #[tokio::test]
    async fn test_unsupported_request_keeps_health() {
        let (link, _handle, _clock) = rtu_link(2, 0);
        let err = link
            .request(&Request::Serial(crate::serial_cmd::SerialCommand::ReadAll))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::UnsupportedRequest { .. }));
        assert!(link.is_healthy());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_requests() {
        let (link, _handle, _clock) = rtu_link(0, 0);
        link.shutdown().await;
        let err = link.request(&read_request()).await.unwrap_err();
        assert!(matches!(err, LinkError::Cancelled));

        link.connect().await.unwrap();
        assert_eq!(link.state().await, LinkState::Connected);
    }

    #[tokio::test]
    async fn test_unbuildable_transport_reports_unavailable() {
        let mut config = TransportConfig::serial("", 9600);
        config.kind = roast_comlink::TransportKind::Bluetooth;
        let link = LinkManager::new(
            "ble",
            config,
            Protocol::ModbusRtu.codec(0, 0),
            Arc::new(ManualClock::new()),
        );
        assert!(matches!(link.state().await, LinkState::Failed(_)));
        assert!(matches!(
            link.request(&read_request()).await,
            Err(LinkError::PortUnavailable(_))
        ));
    }
}
