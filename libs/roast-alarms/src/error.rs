//! Alarm and command error types

use thiserror::Error;

/// Result type for alarm table and command operations
pub type Result<T> = std::result::Result<T, AlarmError>;

#[derive(Debug, Error)]
pub enum AlarmError {
    /// A table row fails validation
    #[error("Alarm row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },

    #[error("Unknown alarm source: {0}")]
    UnknownSource(String),

    #[error("Unknown roast event: {0}")]
    UnknownEvent(String),

    /// Command string does not follow the grammar
    #[error("Cannot parse command '{command}': {reason}")]
    CommandParse { command: String, reason: String },

    /// Placeholder without a value to substitute
    #[error("No value for placeholder {{{0}}}")]
    UnboundPlaceholder(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl AlarmError {
    pub fn invalid_row(row: usize, reason: impl Into<String>) -> Self {
        AlarmError::InvalidRow {
            row,
            reason: reason.into(),
        }
    }

    pub fn parse(command: impl Into<String>, reason: impl Into<String>) -> Self {
        AlarmError::CommandParse {
            command: command.into(),
            reason: reason.into(),
        }
    }
}
