//! Failure taxonomy shared by errors and connection events.
//!
//! Kinds serialize using `SCREAMING_SNAKE_CASE` (e.g. `"ROOM_NOT_FOUND"`) so
//! they can be forwarded to a UI layer or written to logs verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of everything that can go wrong in a session.
///
/// Use [`description()`](ErrorKind::description) for a human-readable explanation
/// and [`is_terminal()`](ErrorKind::is_terminal) to decide whether to keep retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Connection setup did not complete in time.
    ConnectionTimeout,
    /// The join target no longer exists.
    RoomNotFound,
    /// Generic channel failure.
    TransportError,
    /// A malformed or unknown payload was received.
    MessageValidationFailure,
    /// The heartbeat declared the connection dead.
    StaleConnection,
    /// The operation was abandoned because the channel was torn down.
    Cancelled,
    /// The caller asked for something its role or the session phase forbids.
    InvalidOperation,
}

impl ErrorKind {
    /// Returns a human-readable description of this kind.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ConnectionTimeout => {
                "Could not reach the session in time. Check your connection and try again."
            }
            Self::RoomNotFound => {
                "This session is no longer available. The host may have ended it."
            }
            Self::TransportError => "The connection was interrupted. Reconnecting…",
            Self::MessageValidationFailure => "A malformed message was received and ignored.",
            Self::StaleConnection => "The other device stopped responding. Reconnecting…",
            Self::Cancelled => "The connection attempt was cancelled.",
            Self::InvalidOperation => "That action is not available right now.",
        }
    }

    /// Returns `true` if retrying cannot succeed and the UI should stop trying.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RoomNotFound | Self::InvalidOperation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RoomNotFound).unwrap();
        assert_eq!(json, "\"ROOM_NOT_FOUND\"");
        let back: ErrorKind = serde_json::from_str("\"STALE_CONNECTION\"").unwrap();
        assert_eq!(back, ErrorKind::StaleConnection);
    }

    #[test]
    fn only_room_not_found_and_invalid_operation_are_terminal() {
        assert!(ErrorKind::RoomNotFound.is_terminal());
        assert!(ErrorKind::InvalidOperation.is_terminal());
        assert!(!ErrorKind::ConnectionTimeout.is_terminal());
        assert!(!ErrorKind::TransportError.is_terminal());
        assert!(!ErrorKind::StaleConnection.is_terminal());
    }
}
