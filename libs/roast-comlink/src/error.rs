//! Transport Error Types

use thiserror::Error;

/// Result type for roast-comlink operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport layer errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Port could not be opened or socket could not connect
    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer closed the connection
    #[error("Connection closed: {0}")]
    Closed(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Not supported
    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout(err.to_string()),
            std::io::ErrorKind::UnexpectedEof => TransportError::Closed(err.to_string()),
            _ => TransportError::Io(err.to_string()),
        }
    }
}

// Helper methods for creating errors
impl TransportError {
    pub fn port_unavailable(msg: impl Into<String>) -> Self {
        TransportError::PortUnavailable(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        TransportError::Timeout(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        TransportError::Io(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TransportError::Config(msg.into())
    }

    /// Check if this error indicates a need for reconnection
    pub fn needs_reconnect(&self) -> bool {
        match self {
            TransportError::Io(msg) => {
                msg.contains("Broken pipe")
                    || msg.contains("Connection reset")
                    || msg.contains("Connection refused")
                    || msg.contains("Connection aborted")
                    || msg.contains("Network is unreachable")
            },
            TransportError::Closed(_) => true,
            TransportError::NotConnected => true,
            _ => false,
        }
    }
}
