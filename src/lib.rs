//! # tabsync
//!
//! Host-authoritative, real-time session sync for splitting a bill across
//! several devices.
//!
//! One device hosts: it owns the bill (items, participants, claims, tips)
//! and the workflow phase. Guests join with a short room code, send intents
//! ("I had the soup", "20% tip for me") and render whatever full snapshot the
//! host broadcasts last. Guests never mutate shared state locally, so there
//! is nothing to merge.
//!
//! ## Layers
//!
//! - [`link`]: one bidirectional text connection, and [`Connector`](link::Connector)s that produce them
//! - [`transport`]: the [`Transport`] contract and [`Channel`], its generic implementation
//!   (timeouts, retry with backoff, heartbeats, validation, events)
//! - [`transports`]: in-process, peer-to-peer and relay connectors
//! - [`host`] / [`guest`]: the orchestrator that turns intents into state, and
//!   the client that follows it across reconnects
//! - [`session`]: the facade UI code talks to
//!
//! ## Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), tabsync::SyncError> {
//! use tabsync::store::SessionContext;
//! use tabsync::transports::{MemoryConnector, MemoryTransport};
//! use tabsync::{BillItem, Participant, Session, SessionConfig, SessionPhase};
//!
//! let connector = MemoryConnector::new();
//! let config = SessionConfig::default();
//!
//! let context = SessionContext::new();
//! context.init(
//!     vec![BillItem::new("soup", "Soup", 7.5)],
//!     vec![Participant::new("ana", "Ana"), Participant::new("ben", "Ben")],
//! );
//! let host = Session::host(MemoryTransport::new(connector.clone(), config.clone()), context, config.clone()).await?;
//! let room_code = host.room_code().unwrap_or_default();
//!
//! let guest = Session::join(MemoryTransport::new(connector, config), &room_code).await?;
//! guest.identify("ben", Some("Ben".into()))?;
//! host.advance_phase(SessionPhase::Claiming)?;
//! guest.send_claim("soup", "ben")?;
//!
//! guest.end_session().await;
//! host.end_session().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod debounce;
pub mod error;
pub mod error_kind;
pub mod event;
pub mod guest;
pub mod heartbeat;
pub mod host;
pub mod link;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod transports;
pub mod view;

pub use config::SessionConfig;
pub use error::SyncError;
pub use error_kind::ErrorKind;
pub use event::{ConnectionStatus, TransportEvent};
pub use protocol::{
    BillItem, GuestMessage, HostMessage, Participant, SessionPhase, SyncPayload, TipChoice,
    TipMode,
};
pub use session::Session;
pub use transport::{Channel, Role, Transport};

/// Lock a std mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
