//! Low-level connection abstractions underneath a [`Channel`](crate::transport::Channel).
//!
//! A [`Link`] is one bidirectional text message connection between a host and
//! a single guest. The sync protocol uses JSON text frames, so every link
//! implementation must handle message framing internally (WebSocket frames,
//! in-process channels, relay envelopes, ...).
//!
//! A [`Connector`] knows how to produce links: a host registers a room and
//! receives a stream of incoming guest links, a guest dials a room code and
//! receives the link to its host. The timeout, retry, heartbeat and event
//! machinery lives one layer up and is shared by every connector.
//!
//! # Implementing a Custom Link
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use tabsync::error::SyncError;
//! use tabsync::link::Link;
//!
//! struct MyLink { /* ... */ }
//!
//! #[async_trait]
//! impl Link for MyLink {
//!     async fn send(&mut self, message: String) -> Result<(), SyncError> {
//!         // Send one JSON text frame
//!         # Ok(())
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, SyncError>> {
//!         // Receive the next JSON text frame; None once the peer closed cleanly
//!         # None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SyncError> {
//!         // Shut the connection down
//!         # Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::protocol::PeerId;

/// Unambiguous uppercase alphabet (no `I`, `O`, `0`, `1`) for hand-typed codes.
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of generated room codes.
pub const ROOM_CODE_LEN: usize = 6;

/// A bidirectional text frame connection to one remote device.
///
/// # Object Safety
///
/// This trait is object-safe; connectors hand out `Box<dyn Link>`.
///
/// # Cancel Safety
///
/// [`recv`](Link::recv) **MUST** be cancel-safe because it is polled inside
/// `tokio::select!`. Channel-based implementations are naturally cancel-safe.
#[async_trait]
pub trait Link: Send + 'static {
    /// Send one JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TransportSend`] or [`SyncError::TransportClosed`]
    /// if the frame could not be sent.
    async fn send(&mut self, message: String) -> Result<()>;

    /// Receive the next JSON text frame.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the remote side closed the connection cleanly
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Close the connection. Implementations must release resources even if
    /// the close handshake fails, and a second call must be a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// A guest link accepted by a hosting connector.
pub struct IncomingGuest {
    pub peer_id: PeerId,
    pub link: Box<dyn Link>,
}

impl std::fmt::Debug for IncomingGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingGuest")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// A live host registration.
///
/// Guests keep arriving on `incoming` until the registration is dropped,
/// which releases the room.
#[derive(Debug)]
pub struct HostRegistration {
    pub room_code: String,
    pub incoming: mpsc::UnboundedReceiver<IncomingGuest>,
}

/// Establishes links for one underlying mechanism.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Register as the host of a room.
    ///
    /// `room_code` is `Some` when re-registering after a connectivity failure,
    /// in which case the connector should try to reclaim the same code.
    ///
    /// # Errors
    ///
    /// A code still held by a live host must fail with a retriable error,
    /// never be taken over.
    async fn host(&self, room_code: Option<&str>) -> Result<HostRegistration>;

    /// Connect to the host of `room_code`.
    ///
    /// # Errors
    ///
    /// Must return [`SyncError::RoomNotFound`] when the room definitely does
    /// not exist, so callers can stop retrying.
    async fn dial(&self, room_code: &str) -> Result<Box<dyn Link>>;
}

/// Generate a short, hand-typeable room code.
pub fn generate_room_code() -> String {
    Uuid::new_v4()
        .into_bytes()
        .iter()
        .take(ROOM_CODE_LEN)
        .map(|b| {
            let index = usize::from(*b) % ROOM_CODE_ALPHABET.len();
            ROOM_CODE_ALPHABET.get(index).copied().map_or('A', char::from)
        })
        .collect()
}

/// Generate a fresh transport-level peer id.
pub fn generate_peer_id() -> PeerId {
    Uuid::new_v4().to_string()
}

pub(crate) fn room_not_found(room_code: &str) -> SyncError {
    SyncError::RoomNotFound {
        room_code: room_code.to_string(),
    }
}

/// A live host already holds `room_code`. Retriable: the holder may be a
/// registration that is still being released.
pub(crate) fn room_taken(room_code: &str) -> SyncError {
    SyncError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("room {room_code} is already hosted"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_codes_are_short_and_unambiguous() {
        for _ in 0..100 {
            let code = generate_room_code();
            assert_eq!(code.len(), ROOM_CODE_LEN);
            assert!(code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)));
            assert!(!code.contains('O') && !code.contains('0'));
        }
    }

    #[test]
    fn peer_ids_are_unique() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
