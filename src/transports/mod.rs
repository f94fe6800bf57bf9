//! Concrete [`Connector`](crate::link::Connector)s.
//!
//! | Connector              | Mechanism                           | Feature               |
//! |------------------------|-------------------------------------|-----------------------|
//! | [`MemoryConnector`]    | in-process channels                 | always                |
//! | [`DirectConnector`]    | guest dials the host's WebSocket    | `transport-websocket` |
//! | [`RelayConnector`]     | both sides go through a relay       | `transport-websocket` |
//!
//! Each pairs with [`Channel`](crate::transport::Channel) to form a full
//! [`Transport`](crate::transport::Transport):
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), tabsync::SyncError> {
//! use tabsync::{SessionConfig, Transport};
//! use tabsync::transports::{RelayConnector, RelayTransport};
//!
//! let transport = RelayTransport::new(
//!     RelayConnector::new("wss://relay.example.com/ws"),
//!     SessionConfig::default(),
//! );
//! let room_code = transport.start_host().await?;
//! println!("share this code: {room_code}");
//! # Ok(())
//! # }
//! ```

use crate::transport::Channel;

pub mod memory;

pub use memory::MemoryConnector;

pub type MemoryTransport = Channel<MemoryConnector>;

#[cfg(feature = "transport-websocket")]
pub mod direct;
#[cfg(feature = "transport-websocket")]
pub mod relay;
#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use direct::DirectConnector;
#[cfg(feature = "transport-websocket")]
pub use relay::RelayConnector;
#[cfg(feature = "transport-websocket")]
pub use websocket::WebSocketLink;

/// Peer-to-peer transport.
#[cfg(feature = "transport-websocket")]
pub type DirectTransport = Channel<DirectConnector>;

/// Relay-mediated transport.
#[cfg(feature = "transport-websocket")]
pub type RelayTransport = Channel<RelayConnector>;
