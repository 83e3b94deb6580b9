//! Error types of the roast service
//!
//! One enum per component; `RoastError` aggregates them for the service
//! surface and the binary.

use roast_alarms::AlarmError;
use roast_comlink::TransportError;
use roast_protocols::{FrameError, LinkError};
use thiserror::Error;

use crate::pid::PidMode;

/// Result type alias for the roast service
pub type Result<T> = std::result::Result<T, RoastError>;

/// Device registry errors
///
/// Reads degrade these to a `None` value for the channel.
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Unknown link: {0}")]
    UnknownLink(String),

    #[error("Channel {0} has a zero divider")]
    DividerZero(String),

    #[error("Channel {0} is not writable")]
    NotWritable(String),

    #[error("Channel {channel}: {reason}")]
    InvalidAddress { channel: String, reason: String },

    #[error("Unexpected reply from {link}: {reason}")]
    UnexpectedResponse { link: String, reason: String },

    #[error("Serial reply has no field {index}")]
    MissingField { index: usize },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

impl RegistryError {
    pub fn unexpected(link: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistryError::UnexpectedResponse {
            link: link.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_address(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistryError::InvalidAddress {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

/// PID controller errors; the controller state is unchanged when one is returned
#[derive(Debug, Error, Clone)]
pub enum PidError {
    /// Read-back after a write returned a different value
    #[error("{what} write not acknowledged: wrote {written}, device reports {read}")]
    NotAcknowledged {
        what: &'static str,
        written: f64,
        read: f64,
    },

    #[error("Cannot switch PID from {from} to {to}")]
    InvalidTransition { from: PidMode, to: PidMode },

    #[error("{count} ramp/soak segments exceed the {max} supported by {family}")]
    TooManySegments {
        count: usize,
        max: usize,
        family: &'static str,
    },

    #[error("{family} controllers have no {feature}")]
    Unsupported {
        family: &'static str,
        feature: &'static str,
    },

    #[error("Invalid PID value: {0}")]
    InvalidValue(String),

    #[error("Unexpected reply from PID: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Command dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Command(#[from] AlarmError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pid(#[from] PidError),

    #[error("No {0} link configured for commands")]
    NoLink(&'static str),

    #[error("No PID controller configured")]
    NoPid,

    #[error("Invalid {what} in action: {value}")]
    InvalidPayload { what: &'static str, value: String },

    #[error("Too many nested button/slider commands in {0}")]
    ExpansionLimit(String),
}

/// Service-level error
#[derive(Debug, Error)]
pub enum RoastError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Alarm(#[from] AlarmError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pid(#[from] PidError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Session is not running")]
    SessionClosed,
}

impl RoastError {
    pub fn config(msg: impl Into<String>) -> Self {
        RoastError::Config(msg.into())
    }
}

impl From<figment::Error> for RoastError {
    fn from(err: figment::Error) -> Self {
        RoastError::Figment(Box::new(err))
    }
}
