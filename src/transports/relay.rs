//! Server-mediated connector.
//!
//! Every device keeps one WebSocket to a relay. The host's socket carries
//! all of its guests multiplexed; the relay forwards each frame between the
//! host and one guest inside a small JSON envelope ([`RelayFrame`]). Use it
//! where guests cannot reach the host directly.
//!
//! [`serve`] is a minimal relay implementation, enough for local networks,
//! tests and demos.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::link::{
    generate_peer_id, generate_room_code, room_not_found, Connector, HostRegistration,
    IncomingGuest, Link,
};
use crate::lock;
use crate::protocol::PeerId;
use crate::transports::websocket::{ClientStream, WebSocketLink};

/// Error code the relay uses when a joined room does not exist.
pub const ROOM_NOT_FOUND: &str = "room_not_found";
/// Error code the relay uses when a requested room code is held by a live host.
pub const ROOM_TAKEN: &str = "room_taken";
/// Error code the relay uses when a joined room's host dropped off and may
/// still come back. Guests retry it.
pub const HOST_AWAY: &str = "host_away";
const BAD_REQUEST: &str = "bad_request";

/// How long [`serve`] holds a room after its host's socket breaks without a
/// closing handshake.
pub const HOST_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Envelope exchanged between devices and the relay.
///
/// ```json
/// {"type":"send","data":{"to":"<peer id>","data":"{\"type\":\"SYNC_STATE\",...}"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RelayFrame {
    // device → relay
    /// Register as host, optionally reclaiming a previous code.
    #[serde(rename_all = "camelCase")]
    Host { room_code: Option<String> },
    #[serde(rename_all = "camelCase")]
    Join { room_code: String },
    /// Forward a frame. Hosts address a guest; guests always reach the host.
    Send { to: Option<PeerId>, data: String },
    /// (host) Disconnect a guest.
    #[serde(rename_all = "camelCase")]
    Kick { peer_id: PeerId },

    // relay → device
    #[serde(rename_all = "camelCase")]
    Hosted { room_code: String },
    #[serde(rename_all = "camelCase")]
    Joined { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },
    /// A forwarded frame. `from` is the guest's peer id, or `None` when sent by the host.
    Data { from: Option<PeerId>, data: String },
    Error { code: String, message: String },
}

/// Connector that reaches hosts through a relay at `url`.
#[derive(Debug, Clone)]
pub struct RelayConnector {
    url: String,
}

impl RelayConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn host(&self, room_code: Option<&str>) -> Result<HostRegistration> {
        let mut socket = WebSocketLink::connect(&self.url).await?;
        send_frame(
            &mut socket,
            &RelayFrame::Host {
                room_code: room_code.map(str::to_string),
            },
        )
        .await?;
        let room_code = match expect_frame(&mut socket).await? {
            RelayFrame::Hosted { room_code } => room_code,
            RelayFrame::Error { code, message } => return Err(relay_error(&code, message)),
            other => return Err(unexpected(&other)),
        };
        info!(room_code = %room_code, url = %self.url, "registered with relay");

        let (tx, incoming) = mpsc::unbounded_channel();
        tokio::spawn(demux_host_socket(socket, tx));
        Ok(HostRegistration {
            room_code,
            incoming,
        })
    }

    async fn dial(&self, room_code: &str) -> Result<Box<dyn Link>> {
        let mut socket = WebSocketLink::connect(&self.url).await?;
        send_frame(
            &mut socket,
            &RelayFrame::Join {
                room_code: room_code.to_string(),
            },
        )
        .await?;
        match expect_frame(&mut socket).await? {
            RelayFrame::Joined { peer_id } => {
                debug!(room_code = %room_code, peer_id = %peer_id, "joined through relay");
                Ok(Box::new(RelayGuestLink { socket }))
            }
            RelayFrame::Error { code, message } if code == ROOM_NOT_FOUND => {
                debug!(message = %message, "relay does not know the room");
                Err(room_not_found(room_code))
            }
            RelayFrame::Error { code, message } => Err(relay_error(&code, message)),
            other => Err(unexpected(&other)),
        }
    }
}

fn relay_error(code: &str, message: String) -> SyncError {
    if code == ROOM_NOT_FOUND {
        SyncError::RoomNotFound { room_code: message }
    } else {
        SyncError::TransportReceive(format!("relay error {code}: {message}"))
    }
}

fn unexpected(frame: &RelayFrame) -> SyncError {
    SyncError::TransportReceive(format!("unexpected relay frame: {frame:?}"))
}

async fn send_frame<L: Link + ?Sized>(socket: &mut L, frame: &RelayFrame) -> Result<()> {
    socket.send(serde_json::to_string(frame)?).await
}

/// Next well-formed envelope, or `None` once the socket ends.
///
/// Cancel-safe: the only await point is the link's `recv`.
async fn read_frame<L: Link + ?Sized>(socket: &mut L) -> Option<Result<RelayFrame>> {
    loop {
        match socket.recv().await? {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(frame) => return Some(Ok(frame)),
                Err(e) => warn!(error = %e, "dropping malformed relay frame"),
            },
            Err(e) => return Some(Err(e)),
        }
    }
}

async fn expect_frame<L: Link + ?Sized>(socket: &mut L) -> Result<RelayFrame> {
    read_frame(socket).await.unwrap_or(Err(SyncError::TransportClosed))
}

// ── Host side ───────────────────────────────────────────────────────

/// Fan the host socket out into one [`RelayPeerLink`] per guest.
async fn demux_host_socket(
    mut socket: WebSocketLink<ClientStream>,
    incoming: mpsc::UnboundedSender<IncomingGuest>,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
    let mut peers: HashMap<PeerId, mpsc::UnboundedSender<String>> = HashMap::new();

    loop {
        tokio::select! {
            _ = incoming.closed() => break,

            Some(frame) = out_rx.recv() => {
                if let Err(e) = send_frame(&mut socket, &frame).await {
                    warn!(error = %e, "relay send failed");
                    break;
                }
            }

            received = read_frame(&mut socket) => match received {
                Some(Ok(RelayFrame::PeerJoined { peer_id })) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    peers.insert(peer_id.clone(), tx);
                    let link = RelayPeerLink {
                        peer_id: peer_id.clone(),
                        inbound: rx,
                        outbound: out_tx.clone(),
                        closed: false,
                    };
                    let _ = incoming.send(IncomingGuest { peer_id, link: Box::new(link) });
                }
                Some(Ok(RelayFrame::Data { from: Some(peer_id), data })) => {
                    let delivered = peers.get(&peer_id).is_some_and(|tx| tx.send(data).is_ok());
                    if !delivered {
                        peers.remove(&peer_id);
                        debug!(peer_id = %peer_id, "dropping frame for unknown guest");
                    }
                }
                Some(Ok(RelayFrame::PeerLeft { peer_id })) => {
                    // Dropping the sender ends the guest's link.
                    peers.remove(&peer_id);
                }
                Some(Ok(other)) => debug!(frame = ?other, "ignoring relay frame"),
                Some(Err(e)) => {
                    warn!(error = %e, "relay socket failed");
                    break;
                }
                None => {
                    info!("relay closed the host socket");
                    break;
                }
            },
        }
    }

    if let Err(e) = socket.close().await {
        debug!(error = %e, "error closing relay socket");
    }
}

/// The host's view of one guest behind the relay.
#[derive(Debug)]
struct RelayPeerLink {
    peer_id: PeerId,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<RelayFrame>,
    closed: bool,
}

#[async_trait]
impl Link for RelayPeerLink {
    async fn send(&mut self, message: String) -> Result<()> {
        if self.closed {
            return Err(SyncError::TransportClosed);
        }
        self.outbound
            .send(RelayFrame::Send {
                to: Some(self.peer_id.clone()),
                data: message,
            })
            .map_err(|_| SyncError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inbound.close();
        let _ = self.outbound.send(RelayFrame::Kick {
            peer_id: self.peer_id.clone(),
        });
        Ok(())
    }
}

// ── Guest side ──────────────────────────────────────────────────────

/// A guest's link to its host through the relay.
#[derive(Debug)]
struct RelayGuestLink {
    socket: WebSocketLink<ClientStream>,
}

#[async_trait]
impl Link for RelayGuestLink {
    async fn send(&mut self, message: String) -> Result<()> {
        send_frame(
            &mut self.socket,
            &RelayFrame::Send {
                to: None,
                data: message,
            },
        )
        .await
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match read_frame(&mut self.socket).await? {
                Ok(RelayFrame::Data { data, .. }) => return Some(Ok(data)),
                Ok(RelayFrame::Error { code, message }) => {
                    return Some(Err(relay_error(&code, message)))
                }
                Ok(other) => debug!(frame = ?other, "ignoring relay frame"),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.socket.close().await
    }
}

// ── Relay server ────────────────────────────────────────────────────

type Rooms = Arc<Directory>;

struct Directory {
    grace: Duration,
    rooms: Mutex<HashMap<String, RelayRoom>>,
}

struct RelayRoom {
    /// `None` while the host is away.
    host: Option<RelayHost>,
    /// When the host dropped off without closing its socket.
    vacated_at: Option<Instant>,
    guests: HashMap<PeerId, mpsc::UnboundedSender<RelayFrame>>,
}

struct RelayHost {
    id: String,
    tx: mpsc::UnboundedSender<RelayFrame>,
}

impl RelayRoom {
    fn hosted_by(id: String, tx: mpsc::UnboundedSender<RelayFrame>) -> Self {
        Self {
            host: Some(RelayHost { id, tx }),
            vacated_at: None,
            guests: HashMap::new(),
        }
    }

    fn live_host(&self) -> Option<&RelayHost> {
        self.host.as_ref().filter(|host| !host.tx.is_closed())
    }

    /// Drop the host and every guest. Dropping a guest's sender closes its socket.
    fn vacate(&mut self) {
        self.host = None;
        self.vacated_at = Some(Instant::now());
        self.guests.clear();
    }

    /// Whether the code is still reserved: a live host, or one that left
    /// less than `grace` ago.
    fn is_held(&mut self, grace: Duration) -> bool {
        if self.host.is_some() && self.live_host().is_none() {
            self.vacate();
        }
        match self.vacated_at {
            Some(at) if self.host.is_none() => at.elapsed() < grace,
            _ => true,
        }
    }
}

/// What one relay connection turned out to be.
enum Member {
    Host { room_code: String, host_id: String },
    Guest { room_code: String, peer_id: PeerId },
}

/// Run a relay on `listener` until the task is dropped.
///
/// A host that closes its socket releases its room at once. A host whose
/// socket breaks keeps its code for [`HOST_GRACE_PERIOD`] so it can register
/// again with the same code; guests joining meanwhile get [`HOST_AWAY`].
/// Nothing is persisted.
pub async fn serve(listener: TcpListener) {
    serve_with_grace(listener, HOST_GRACE_PERIOD).await;
}

/// [`serve`] with a custom grace period for hosts that drop off.
pub async fn serve_with_grace(listener: TcpListener, grace: Duration) {
    let rooms: Rooms = Arc::new(Directory {
        grace,
        rooms: Mutex::default(),
    });
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, ?grace, "relay listening");
    }
    loop {
        match listener.accept().await {
            Ok((tcp, remote)) => {
                tokio::spawn(serve_socket(Arc::clone(&rooms), tcp, remote));
            }
            Err(e) => warn!(error = %e, "relay accept failed"),
        }
    }
}

async fn serve_socket(rooms: Rooms, tcp: TcpStream, remote: SocketAddr) {
    let stream = match tokio_tungstenite::accept_async(tcp).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%remote, error = %e, "relay handshake failed");
            return;
        }
    };
    let mut socket = WebSocketLink::new(stream);

    let Some(Ok(first)) = read_frame(&mut socket).await else {
        return;
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let member = match admit(&rooms, first, &tx) {
        Ok(member) => member,
        Err(reply) => {
            let _ = send_frame(&mut socket, &reply).await;
            let _ = socket.close().await;
            return;
        }
    };
    // The room now holds the only sender; removing it from the room closes this socket.
    drop(tx);

    let clean = loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(frame) => {
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break false;
                    }
                }
                None => break true,
            },
            incoming = read_frame(&mut socket) => match incoming {
                Some(Ok(frame)) => route(&rooms, &member, frame),
                Some(Err(e)) => {
                    debug!(%remote, error = %e, "relay socket broke");
                    break false;
                }
                None => break true,
            },
        }
    };

    leave(&rooms, &member, clean);
    let _ = socket.close().await;
}

/// Register a new connection as host or guest. On refusal, returns the error frame to send.
fn admit(
    rooms: &Rooms,
    first: RelayFrame,
    tx: &mpsc::UnboundedSender<RelayFrame>,
) -> std::result::Result<Member, RelayFrame> {
    let grace = rooms.grace;
    let mut rooms = lock(&rooms.rooms);
    rooms.retain(|_, room| room.is_held(grace));

    match first {
        RelayFrame::Host { room_code } => {
            let host_id = generate_peer_id();
            let room_code = match room_code {
                Some(code) => match rooms.get_mut(&code) {
                    Some(room) if room.live_host().is_some() => {
                        return Err(RelayFrame::Error {
                            code: ROOM_TAKEN.into(),
                            message: code,
                        });
                    }
                    Some(room) => {
                        info!(room_code = %code, "host is back");
                        *room = RelayRoom::hosted_by(host_id.clone(), tx.clone());
                        code
                    }
                    None => {
                        let room = RelayRoom::hosted_by(host_id.clone(), tx.clone());
                        rooms.insert(code.clone(), room);
                        code
                    }
                },
                None => {
                    let code = loop {
                        let candidate = generate_room_code();
                        if !rooms.contains_key(&candidate) {
                            break candidate;
                        }
                    };
                    let room = RelayRoom::hosted_by(host_id.clone(), tx.clone());
                    rooms.insert(code.clone(), room);
                    code
                }
            };
            let _ = tx.send(RelayFrame::Hosted {
                room_code: room_code.clone(),
            });
            info!(room_code = %room_code, "relay room opened");
            Ok(Member::Host { room_code, host_id })
        }
        RelayFrame::Join { room_code } => {
            let Some(room) = rooms.get_mut(&room_code) else {
                return Err(RelayFrame::Error {
                    code: ROOM_NOT_FOUND.into(),
                    message: room_code,
                });
            };
            let Some(host) = room.live_host() else {
                debug!(room_code = %room_code, "join while the host is away");
                return Err(RelayFrame::Error {
                    code: HOST_AWAY.into(),
                    message: room_code,
                });
            };
            let peer_id = generate_peer_id();
            let _ = host.tx.send(RelayFrame::PeerJoined {
                peer_id: peer_id.clone(),
            });
            room.guests.insert(peer_id.clone(), tx.clone());
            let _ = tx.send(RelayFrame::Joined {
                peer_id: peer_id.clone(),
            });
            debug!(room_code = %room_code, peer_id = %peer_id, "relay guest joined");
            Ok(Member::Guest { room_code, peer_id })
        }
        other => Err(RelayFrame::Error {
            code: BAD_REQUEST.into(),
            message: format!("expected host or join, got {other:?}"),
        }),
    }
}

fn route(rooms: &Rooms, member: &Member, frame: RelayFrame) {
    let mut rooms = lock(&rooms.rooms);
    match (member, frame) {
        (Member::Host { room_code, .. }, RelayFrame::Send { to, data }) => {
            let Some(room) = rooms.get(room_code) else {
                return;
            };
            let targets = room
                .guests
                .iter()
                .filter(|(peer_id, _)| to.as_ref().map_or(true, |to| to == *peer_id));
            for (_, guest) in targets {
                let _ = guest.send(RelayFrame::Data {
                    from: None,
                    data: data.clone(),
                });
            }
        }
        (Member::Host { room_code, .. }, RelayFrame::Kick { peer_id }) => {
            if let Some(room) = rooms.get_mut(room_code) {
                room.guests.remove(&peer_id);
            }
        }
        (Member::Guest { room_code, peer_id }, RelayFrame::Send { data, .. }) => {
            if let Some(host) = rooms.get(room_code).and_then(RelayRoom::live_host) {
                let _ = host.tx.send(RelayFrame::Data {
                    from: Some(peer_id.clone()),
                    data,
                });
            }
        }
        (_, other) => debug!(frame = ?other, "relay ignoring frame"),
    }
}

/// Unregister a connection. `clean` is whether its socket ended with a
/// closing handshake.
fn leave(rooms: &Rooms, member: &Member, clean: bool) {
    let mut rooms = lock(&rooms.rooms);
    match member {
        Member::Host { room_code, host_id } => {
            let Some(room) = rooms.get_mut(room_code) else {
                return;
            };
            if !room.host.as_ref().is_some_and(|host| &host.id == host_id) {
                return;
            }
            if clean {
                rooms.remove(room_code);
                info!(room_code = %room_code, "relay room closed");
            } else {
                room.vacate();
                info!(room_code = %room_code, "relay host dropped off; holding the room");
            }
        }
        Member::Guest { room_code, peer_id } => {
            if let Some(room) = rooms.get_mut(room_code) {
                if room.guests.remove(peer_id).is_some() {
                    if let Some(host) = room.live_host() {
                        let _ = host.tx.send(RelayFrame::PeerLeft {
                            peer_id: peer_id.clone(),
                        });
                    }
                }
            }
        }
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
    use serde_json::json;
    use std::time::Duration;

    async fn start_relay() -> RelayConnector {
        start_relay_with_grace(HOST_GRACE_PERIOD).await
    }

    async fn start_relay_with_grace(grace: Duration) -> RelayConnector {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_with_grace(listener, grace));
        RelayConnector::new(format!("ws://{addr}"))
    }

    /// Register a host over a bare socket that can vanish without a closing handshake.
    async fn bare_host(relay: &RelayConnector) -> (WebSocketLink<ClientStream>, String) {
        let mut socket = WebSocketLink::connect(relay.url()).await.unwrap();
        send_frame(&mut socket, &RelayFrame::Host { room_code: None })
            .await
            .unwrap();
        match expect_frame(&mut socket).await.unwrap() {
            RelayFrame::Hosted { room_code } => (socket, room_code),
            other => panic!("expected hosted, got {other:?}"),
        }
    }

    /// Dial until the relay refuses, i.e. once it has noticed the host is gone.
    async fn dial_until_refused(relay: &RelayConnector, code: &str) -> SyncError {
        for _ in 0..100 {
            if let Err(e) = relay.dial(code).await {
                return e;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("relay kept admitting guests to {code}");
    }

    #[test]
    fn envelope_wire_shape() {
        let frame = RelayFrame::Send {
            to: Some("peer-1".into()),
            data: r#"{"type":"__PING"}"#.into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "send", "data": {"to": "peer-1", "data": "{\"type\":\"__PING\"}"}})
        );
        let joined: RelayFrame =
            serde_json::from_str(r#"{"type":"peer_joined","data":{"peerId":"p"}}"#).unwrap();
        assert_eq!(joined, RelayFrame::PeerJoined { peer_id: "p".into() });
    }

    #[tokio::test]
    async fn frames_flow_between_host_and_guest() {
        let relay = start_relay().await;
        let mut registration = relay.host(None).await.unwrap();
        assert_eq!(registration.room_code.len(), crate::link::ROOM_CODE_LEN);

        let mut guest = relay.dial(&registration.room_code).await.unwrap();
        let IncomingGuest { mut link, .. } = registration.incoming.recv().await.unwrap();

        guest.send("to host".into()).await.unwrap();
        assert_eq!(link.recv().await.unwrap().unwrap(), "to host");
        link.send("to guest".into()).await.unwrap();
        assert_eq!(guest.recv().await.unwrap().unwrap(), "to guest");
    }

    #[tokio::test]
    async fn unknown_room_is_room_not_found() {
        let relay = start_relay().await;
        let result = relay.dial("NOPE42").await;
        assert!(matches!(result, Err(SyncError::RoomNotFound { room_code }) if room_code == "NOPE42"));
    }

    #[tokio::test]
    async fn guest_leaving_ends_the_host_side_link() {
        let relay = start_relay().await;
        let mut registration = relay.host(None).await.unwrap();
        let mut guest = relay.dial(&registration.room_code).await.unwrap();
        let IncomingGuest { mut link, .. } = registration.incoming.recv().await.unwrap();

        guest.close().await.unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(5), link.recv())
            .await
            .unwrap();
        assert!(ended.is_none());
    }

    #[tokio::test]
    async fn kicked_guest_sees_the_link_close() {
        let relay = start_relay().await;
        let mut registration = relay.host(None).await.unwrap();
        let mut guest = relay.dial(&registration.room_code).await.unwrap();
        let IncomingGuest { mut link, .. } = registration.incoming.recv().await.unwrap();

        link.close().await.unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(5), guest.recv())
            .await
            .unwrap();
        assert!(!matches!(ended, Some(Ok(_))));
    }

    #[tokio::test]
    async fn dropping_the_registration_closes_the_room() {
        let relay = start_relay().await;
        let registration = relay.host(None).await.unwrap();
        let code = registration.room_code.clone();
        drop(registration);

        // The relay forgets the room once the host socket is gone.
        let mut result = relay.dial(&code).await;
        for _ in 0..50 {
            if matches!(result, Err(SyncError::RoomNotFound { .. })) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            result = relay.dial(&code).await;
        }
        assert!(matches!(result, Err(SyncError::RoomNotFound { .. })));
    }

    #[tokio::test]
    async fn host_that_drops_off_can_reclaim_its_room() {
        let relay = start_relay().await;
        let (socket, code) = bare_host(&relay).await;
        drop(socket);

        let err = dial_until_refused(&relay, &code).await;
        assert!(err.is_retriable(), "guests must keep trying, got {err:?}");
        assert!(err.to_string().contains(HOST_AWAY));

        let mut registration = relay.host(Some(&code)).await.unwrap();
        assert_eq!(registration.room_code, code);
        let mut guest = relay.dial(&code).await.unwrap();
        let IncomingGuest { mut link, .. } = registration.incoming.recv().await.unwrap();
        guest.send("back again".into()).await.unwrap();
        assert_eq!(link.recv().await.unwrap().unwrap(), "back again");
    }

    #[tokio::test]
    async fn guests_of_a_host_that_dropped_off_are_disconnected() {
        let relay = start_relay().await;
        let (socket, code) = bare_host(&relay).await;
        let mut guest = relay.dial(&code).await.unwrap();
        drop(socket);

        let ended = tokio::time::timeout(Duration::from_secs(5), guest.recv())
            .await
            .unwrap();
        assert!(!matches!(ended, Some(Ok(_))));
    }

    #[tokio::test]
    async fn held_room_is_released_after_the_grace_period() {
        let relay = start_relay_with_grace(Duration::from_millis(200)).await;
        let (socket, code) = bare_host(&relay).await;
        drop(socket);
        assert!(dial_until_refused(&relay, &code).await.is_retriable());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let result = relay.dial(&code).await;
        assert!(matches!(result, Err(SyncError::RoomNotFound { .. })));
    }

    #[tokio::test]
    async fn live_room_code_cannot_be_taken() {
        let relay = start_relay().await;
        let registration = relay.host(None).await.unwrap();
        let err = relay
            .host(Some(&registration.room_code))
            .await
            .unwrap_err();
        assert!(err.is_retriable(), "a reclaim race must be retried, got {err:?}");
    }
}
