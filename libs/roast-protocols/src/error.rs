//! Frame and link error types

use roast_comlink::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Frame-level errors
///
/// Reported per attempt; the codec never retries on its own.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("CRC mismatch: computed {computed:#06X}, received {received:#06X}")]
    CrcMismatch { computed: u16, received: u16 },

    #[error("LRC mismatch: computed {computed:#04X}, received {received:#04X}")]
    LrcMismatch { computed: u8, received: u8 },

    #[error("Short frame: expected {expected} bytes, got {actual}")]
    ShortFrame { expected: usize, actual: usize },

    #[error("Invalid BCD value {0:#X}")]
    InvalidBcd(u32),

    #[error("Unsupported function code {0:#04X}")]
    UnsupportedFunction(u8),

    #[error("Modbus exception {code:#04X} ({}) for function {function:#04X}", crate::modbus::exception_name(*.code))]
    Exception { function: u8, code: u8 },

    #[error("Transaction mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    #[error("Value {value} out of range for {kind}")]
    OutOfRange { value: f64, kind: &'static str },

    #[error("S7 error: {0}")]
    S7(String),

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

impl FrameError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        FrameError::Malformed(msg.into())
    }

    pub fn s7(msg: impl Into<String>) -> Self {
        FrameError::S7(msg.into())
    }

    /// Fewer bytes than required
    pub fn short(expected: usize, actual: usize) -> Self {
        FrameError::ShortFrame { expected, actual }
    }
}

/// Link-level errors
#[derive(Debug, Error, Clone)]
pub enum LinkError {
    /// No complete reply within the configured timeout
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// Every attempt failed
    #[error("Communication failed after {attempts} attempts: {last}")]
    CommunicationFailed { attempts: u32, last: Box<LinkError> },

    /// Port cannot be opened; sticky until the link is reconfigured
    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    /// Reopening a dropped connection failed; retried like any transient error
    #[error("Reconnect failed: {0}")]
    Reconnect(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Request targets a protocol family the link does not speak
    #[error("{codec} link cannot carry {request}")]
    UnsupportedRequest {
        codec: &'static str,
        request: &'static str,
    },

    #[error("Request cancelled")]
    Cancelled,
}

impl From<TransportError> for LinkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PortUnavailable(msg) => LinkError::PortUnavailable(msg),
            TransportError::Unsupported(msg) => LinkError::PortUnavailable(msg),
            other => LinkError::Transport(other),
        }
    }
}

impl LinkError {
    /// Transient errors are retried; the rest end the request immediately
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LinkError::PortUnavailable(_)
                | LinkError::UnsupportedRequest { .. }
                | LinkError::Cancelled
                | LinkError::CommunicationFailed { .. }
        )
    }

    /// Innermost error, unwrapping `CommunicationFailed`
    pub fn root(&self) -> &LinkError {
        match self {
            LinkError::CommunicationFailed { last, .. } => last.root(),
            other => other,
        }
    }
}
