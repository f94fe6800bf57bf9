//! In-process connector.
//!
//! [`MemoryConnector`] pairs hosts and guests living in the same process
//! through `tokio::sync::mpsc` channels. Clones share one room directory, so
//! hand a clone to every [`Channel`](crate::transport::Channel) that should
//! see the same rooms.
//!
//! Besides local play and tests, it can inject faults that real networks
//! produce but are hard to trigger on demand:
//!
//! - [`sever`](MemoryConnector::sever): both ends of a link see a receive error
//! - [`stall`](MemoryConnector::stall): a half-open link that silently drops every frame
//! - [`close_room`](MemoryConnector::close_room): the room vanishes, future dials get `RoomNotFound`
//! - [`drop_host`](MemoryConnector::drop_host): the host loses its registration but the code
//!   stays reserved for it; dials fail with a retriable error until it registers again

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::link::{
    generate_peer_id, generate_room_code, room_not_found, room_taken, Connector,
    HostRegistration, IncomingGuest, Link,
};
use crate::lock;
use crate::protocol::PeerId;

/// Connector for hosts and guests in the same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    hub: Arc<Mutex<Hub>>,
}

#[derive(Debug, Default)]
struct Hub {
    rooms: HashMap<String, Room>,
}

#[derive(Debug)]
struct Room {
    /// `None` while the host is away after [`MemoryConnector::drop_host`].
    incoming: Option<mpsc::UnboundedSender<IncomingGuest>>,
    links: HashMap<PeerId, Arc<LinkControl>>,
}

impl Room {
    fn is_live(&self) -> bool {
        self.incoming.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// The host dropped its registration.
    fn is_released(&self) -> bool {
        self.incoming.as_ref().is_some_and(|tx| tx.is_closed())
    }

    fn sever_all(&mut self) {
        for control in self.links.values() {
            control.sever();
        }
        self.links.clear();
    }
}

/// Fault switches shared by both ends of one link.
#[derive(Debug)]
struct LinkControl {
    severed: watch::Sender<bool>,
    stalled: AtomicBool,
}

impl LinkControl {
    fn new() -> Self {
        Self {
            severed: watch::channel(false).0,
            stalled: AtomicBool::new(false),
        }
    }

    fn sever(&self) {
        self.severed.send_replace(true);
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a host currently holds `room_code`.
    pub fn has_room(&self, room_code: &str) -> bool {
        lock(&self.hub).rooms.get(room_code).is_some_and(Room::is_live)
    }

    /// Break the link of guest `peer_id`. Both ends see a receive error.
    ///
    /// Returns `false` if no such link exists.
    pub fn sever(&self, peer_id: &str) -> bool {
        match self.control(peer_id) {
            Some(control) => {
                debug!(peer_id = %peer_id, "severing memory link");
                control.sever();
                true
            }
            None => false,
        }
    }

    /// Turn the link of guest `peer_id` half-open: it stays up, but every
    /// frame in either direction is silently dropped.
    ///
    /// Returns `false` if no such link exists.
    pub fn stall(&self, peer_id: &str) -> bool {
        match self.control(peer_id) {
            Some(control) => {
                debug!(peer_id = %peer_id, "stalling memory link");
                control.stalled.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Make `room_code` vanish. Every link into it is severed and later
    /// dials fail with `RoomNotFound`.
    ///
    /// Returns `false` if the room did not exist.
    pub fn close_room(&self, room_code: &str) -> bool {
        let Some(mut room) = lock(&self.hub).rooms.remove(room_code) else {
            return false;
        };
        debug!(room_code = %room_code, links = room.links.len(), "closing memory room");
        room.sever_all();
        true
    }

    /// Take the registration away from the host of `room_code`, as if its
    /// network dropped. Every link into the room is severed. The code stays
    /// reserved: dials fail with a retriable error until a host registers
    /// it again.
    ///
    /// Returns `false` if no live host holds the room.
    pub fn drop_host(&self, room_code: &str) -> bool {
        let mut hub = lock(&self.hub);
        let Some(room) = hub.rooms.get_mut(room_code).filter(|room| room.is_live()) else {
            return false;
        };
        debug!(room_code = %room_code, links = room.links.len(), "dropping memory host");
        room.incoming = None;
        room.sever_all();
        true
    }

    fn control(&self, peer_id: &str) -> Option<Arc<LinkControl>> {
        lock(&self.hub)
            .rooms
            .values()
            .find_map(|room| room.links.get(peer_id).cloned())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn host(&self, room_code: Option<&str>) -> Result<HostRegistration> {
        let (tx, incoming) = mpsc::unbounded_channel();
        let mut hub = lock(&self.hub);
        hub.rooms.retain(|_, room| !room.is_released());

        let room_code = match room_code {
            Some(code) if hub.rooms.get(code).is_some_and(Room::is_live) => {
                return Err(room_taken(code));
            }
            Some(code) => code.to_string(),
            None => loop {
                let candidate = generate_room_code();
                if !hub.rooms.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        hub.rooms.insert(
            room_code.clone(),
            Room {
                incoming: Some(tx),
                links: HashMap::new(),
            },
        );
        debug!(room_code = %room_code, "memory room registered");
        Ok(HostRegistration {
            room_code,
            incoming,
        })
    }

    async fn dial(&self, room_code: &str) -> Result<Box<dyn Link>> {
        let mut hub = lock(&self.hub);
        if hub.rooms.get(room_code).is_some_and(Room::is_released) {
            hub.rooms.remove(room_code);
        }
        let room = match hub.rooms.get_mut(room_code) {
            Some(room) => room,
            None => return Err(room_not_found(room_code)),
        };
        let Some(incoming) = &room.incoming else {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("host of room {room_code} is away"),
            )));
        };

        let peer_id = generate_peer_id();
        let control = Arc::new(LinkControl::new());
        let (host_end, guest_end) = MemoryLink::pair(&control);
        incoming
            .send(IncomingGuest {
                peer_id: peer_id.clone(),
                link: Box::new(host_end),
            })
            .map_err(|_| room_not_found(room_code))?;
        room.links.retain(|_, c| !*c.severed.borrow());
        room.links.insert(peer_id, control);
        Ok(Box::new(guest_end))
    }
}

/// One end of an in-process link.
#[derive(Debug)]
pub struct MemoryLink {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
    control: Arc<LinkControl>,
}

impl MemoryLink {
    fn pair(control: &Arc<LinkControl>) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
                control: Arc::clone(control),
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
                control: Arc::clone(control),
            },
        )
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, message: String) -> Result<()> {
        if *self.control.severed.borrow() {
            return Err(SyncError::TransportSend("link severed".into()));
        }
        let tx = self.tx.as_ref().ok_or(SyncError::TransportClosed)?;
        if self.control.stalled.load(Ordering::SeqCst) {
            return Ok(());
        }
        tx.send(message).map_err(|_| SyncError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        let mut severed = self.control.severed.subscribe();
        tokio::select! {
            biased;
            _ = severed.wait_for(|s| *s) => {
                Some(Err(SyncError::TransportReceive("link severed".into())))
            }
            frame = self.rx.recv() => frame.map(Ok),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn hosted() -> (MemoryConnector, HostRegistration) {
        let connector = MemoryConnector::new();
        let registration = connector.host(None).await.unwrap();
        (connector, registration)
    }

    #[tokio::test]
    async fn dial_delivers_linked_ends() {
        let (connector, mut registration) = hosted().await;
        assert!(connector.has_room(&registration.room_code));

        let mut guest = connector.dial(&registration.room_code).await.unwrap();
        let IncomingGuest { mut link, .. } = registration.incoming.recv().await.unwrap();

        guest.send("hello".into()).await.unwrap();
        assert_eq!(link.recv().await.unwrap().unwrap(), "hello");
        link.send("welcome".into()).await.unwrap();
        assert_eq!(guest.recv().await.unwrap().unwrap(), "welcome");
    }

    #[tokio::test]
    async fn dialing_unknown_or_released_room_fails() {
        let (connector, registration) = hosted().await;
        let code = registration.room_code.clone();
        assert!(matches!(
            connector.dial("ZZZZZZ").await,
            Err(SyncError::RoomNotFound { .. })
        ));

        drop(registration);
        assert!(!connector.has_room(&code));
        assert!(matches!(
            connector.dial(&code).await,
            Err(SyncError::RoomNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn closing_one_end_ends_the_other() {
        let (connector, mut registration) = hosted().await;
        let mut guest = connector.dial(&registration.room_code).await.unwrap();
        let IncomingGuest { mut link, .. } = registration.incoming.recv().await.unwrap();

        guest.close().await.unwrap();
        guest.close().await.unwrap();
        assert!(link.recv().await.is_none());
        assert!(matches!(
            guest.send("late".into()).await,
            Err(SyncError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn sever_breaks_both_ends() {
        let (connector, mut registration) = hosted().await;
        let mut guest = connector.dial(&registration.room_code).await.unwrap();
        let IncomingGuest { peer_id, mut link } = registration.incoming.recv().await.unwrap();

        assert!(connector.sever(&peer_id));
        assert!(matches!(link.recv().await, Some(Err(_))));
        assert!(matches!(guest.recv().await, Some(Err(_))));
        assert!(!connector.sever("unknown-peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_link_drops_frames_silently() {
        let (connector, mut registration) = hosted().await;
        let mut guest = connector.dial(&registration.room_code).await.unwrap();
        let IncomingGuest { peer_id, mut link } = registration.incoming.recv().await.unwrap();

        assert!(connector.stall(&peer_id));
        guest.send("into the void".into()).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), link.recv()).await;
        assert!(received.is_err(), "stalled link must not deliver frames");
    }

    #[tokio::test]
    async fn close_room_severs_links_and_forgets_the_code() {
        let (connector, mut registration) = hosted().await;
        let code = registration.room_code.clone();
        let mut guest = connector.dial(&code).await.unwrap();
        let _host_end = registration.incoming.recv().await.unwrap();

        assert!(connector.close_room(&code));
        assert!(matches!(guest.recv().await, Some(Err(_))));
        assert!(matches!(
            connector.dial(&code).await,
            Err(SyncError::RoomNotFound { .. })
        ));
        assert!(!connector.close_room(&code));
    }

    #[tokio::test]
    async fn host_can_reclaim_its_code() {
        let (connector, registration) = hosted().await;
        let code = registration.room_code.clone();
        drop(registration);

        let again = connector.host(Some(&code)).await.unwrap();
        assert_eq!(again.room_code, code);
        assert!(connector.has_room(&code));
    }

    #[tokio::test]
    async fn dropped_host_keeps_its_code_until_it_returns() {
        let (connector, mut registration) = hosted().await;
        let code = registration.room_code.clone();
        let mut guest = connector.dial(&code).await.unwrap();
        let _host_end = registration.incoming.recv().await.unwrap();

        assert!(connector.drop_host(&code));
        assert!(!connector.drop_host(&code));
        assert!(registration.incoming.recv().await.is_none());
        assert!(matches!(guest.recv().await, Some(Err(_))));
        assert!(!connector.has_room(&code));
        match connector.dial(&code).await {
            Err(e) => assert!(e.is_retriable(), "got {e:?}"),
            Ok(_) => panic!("the host is away"),
        }

        let mut again = connector.host(Some(&code)).await.unwrap();
        assert_eq!(again.room_code, code);
        let _guest = connector.dial(&code).await.unwrap();
        assert!(again.incoming.recv().await.is_some());
    }

    #[tokio::test]
    async fn live_code_cannot_be_taken_over() {
        let (connector, registration) = hosted().await;
        let code = registration.room_code.clone();

        let err = connector.host(Some(&code)).await.unwrap_err();
        assert!(err.is_retriable(), "got {err:?}");
        assert!(matches!(
            &err,
            SyncError::Io(io) if io.kind() == std::io::ErrorKind::AddrInUse
        ));
        assert!(connector.has_room(&code));

        // The original host is untouched.
        let mut registration = registration;
        let _guest = connector.dial(&code).await.unwrap();
        assert!(registration.incoming.recv().await.is_some());
    }
}
