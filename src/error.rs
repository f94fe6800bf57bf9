//! Error types for the session sync core.

use thiserror::Error;

use crate::error_kind::ErrorKind;
use crate::protocol::SessionPhase;

/// Errors that can occur while hosting or joining a session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection setup did not complete within the configured attempts.
    #[error("connection timed out after {attempts} attempt(s)")]
    ConnectionTimeout {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// The room being joined does not exist (or no longer exists).
    #[error("room {room_code} not found")]
    RoomNotFound {
        /// The room code that could not be located.
        room_code: String,
    },

    /// Failed to send a frame over a link.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from a link.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The link was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection.
    #[error("not connected")]
    NotConnected,

    /// The channel was destroyed while the operation was in flight.
    #[error("transport destroyed")]
    Destroyed,

    /// The operation is not available for this device's role.
    #[error("operation not available to the {0}")]
    WrongRole(&'static str),

    /// The host tried to move the workflow backward or to the current phase.
    #[error("invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition {
        /// Phase the session is currently in.
        from: SessionPhase,
        /// Phase that was requested.
        to: SessionPhase,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Classify this error into the failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            Self::RoomNotFound { .. } => ErrorKind::RoomNotFound,
            Self::Serialization(_) => ErrorKind::MessageValidationFailure,
            Self::Destroyed => ErrorKind::Cancelled,
            Self::WrongRole(_) | Self::InvalidPhaseTransition { .. } => ErrorKind::InvalidOperation,
            Self::TransportSend(_)
            | Self::TransportReceive(_)
            | Self::TransportClosed
            | Self::NotConnected
            | Self::Io(_) => ErrorKind::TransportError,
        }
    }

    /// Returns `true` if connection setup may be attempted again after this error.
    pub fn is_retriable(&self) -> bool {
        !self.kind().is_terminal() && !matches!(self, Self::Destroyed)
    }
}

/// A specialized [`Result`] type for session sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn room_not_found_is_terminal() {
        let err = SyncError::RoomNotFound {
            room_code: "ABC123".into(),
        };
        assert_eq!(err.kind(), ErrorKind::RoomNotFound);
        assert!(!err.is_retriable());
        assert_eq!(err.to_string(), "room ABC123 not found");
    }

    #[test]
    fn transport_errors_are_retriable() {
        assert!(SyncError::TransportClosed.is_retriable());
        assert!(SyncError::TransportSend("broken pipe".into()).is_retriable());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(SyncError::from(io).is_retriable());
    }

    #[test]
    fn destroyed_is_not_retriable() {
        assert!(!SyncError::Destroyed.is_retriable());
    }

    #[test]
    fn phase_transition_message_names_both_phases() {
        let err = SyncError::InvalidPhaseTransition {
            from: SessionPhase::Tips,
            to: SessionPhase::Claiming,
        };
        assert_eq!(
            err.to_string(),
            "invalid phase transition from tips to claiming"
        );
    }
}
