//! Error types for the LightSense protocol.

use crate::responses::Response;
use thiserror::Error;

/// Errors that can occur while talking to the instrument.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The link failed to read or write. Fatal for the current connection.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// Unterminated bytes exceeded the framer's buffer limit.
    #[error("buffer overflow: max {max} bytes, got {actual}")]
    BufferOverflow {
        /// Configured buffer limit.
        max: usize,
        /// Residual length that violated the limit.
        actual: usize,
    },

    /// The instrument replied with a payload of the wrong shape.
    #[error("unparsable response to '{command}': expected {expected}, got {text:?}")]
    UnparsableResponse {
        /// Command whose reply could not be converted.
        command: String,
        /// The offending response text.
        text: String,
        /// Name of the expected payload type.
        expected: &'static str,
    },

    /// The instrument answered with an explicit `ERROR` sentinel.
    #[error("device rejected '{command}': {response}")]
    DeviceRejected {
        /// The rejected command.
        command: String,
        /// The full response line.
        response: String,
    },

    /// The reply was neither the expected acknowledgement nor `ERROR`.
    /// An exchange that timed out lands here with [`Response::Empty`].
    #[error("'{command}' not acknowledged: got {response}")]
    Unacknowledged {
        /// The command that was not acknowledged.
        command: String,
        /// What came back instead.
        response: Response,
    },

    /// A command line could not be parsed.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl ProtocolError {
    /// Errors that leave the connection unusable. These are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(_) | ProtocolError::BufferOverflow { .. }
        )
    }

    /// Short stable label, used for metrics and log fields.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ProtocolError::Transport(_) => "transport",
            ProtocolError::BufferOverflow { .. } => "buffer_overflow",
            ProtocolError::UnparsableResponse { .. } => "unparsable",
            ProtocolError::DeviceRejected { .. } => "rejected",
            ProtocolError::Unacknowledged { .. } => "unacknowledged",
            ProtocolError::InvalidCommand(_) => "invalid_command",
        }
    }
}

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
