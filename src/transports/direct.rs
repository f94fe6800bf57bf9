//! Peer-to-peer connector: guests open a WebSocket straight to the host.
//!
//! The host listens on a TCP port and its room code is the address guests
//! dial, e.g. `192.168.1.20:41873`. A refused connection is retriable: the
//! host may be re-registering on the same port. Only a room code that is not
//! an address is reported as [`SyncError::RoomNotFound`](crate::SyncError::RoomNotFound).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::link::{
    generate_peer_id, room_not_found, Connector, HostRegistration, IncomingGuest, Link,
};
use crate::transports::websocket::WebSocketLink;

const DEFAULT_BIND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
/// Tries at getting the previous port back while the old listener is released.
const REBIND_ATTEMPTS: u32 = 10;
const REBIND_DELAY: Duration = Duration::from_millis(50);

/// Connector for direct host-to-guest WebSocket links.
#[derive(Debug, Clone)]
pub struct DirectConnector {
    bind: SocketAddr,
    advertise: Option<IpAddr>,
}

impl Default for DirectConnector {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND,
            advertise: None,
        }
    }
}

impl DirectConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `addr` when hosting. Port `0` picks a free port.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind = addr;
        self
    }

    /// IP written into room codes, for hosts bound to a wildcard address.
    ///
    /// Without it a wildcard bind advertises the loopback address.
    #[must_use]
    pub fn with_advertised_ip(mut self, ip: IpAddr) -> Self {
        self.advertise = Some(ip);
        self
    }

    fn room_code_for(&self, local: SocketAddr) -> String {
        let ip = match (self.advertise, local.ip()) {
            (Some(ip), _) => ip,
            (None, ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (None, ip) => ip,
        };
        SocketAddr::new(ip, local.port()).to_string()
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn host(&self, room_code: Option<&str>) -> Result<HostRegistration> {
        // Re-registering tries to get the same port back so guests can rejoin.
        let bind = match room_code.map(str::parse::<SocketAddr>) {
            Some(Ok(previous)) => SocketAddr::new(self.bind.ip(), previous.port()),
            Some(Err(_)) | None => self.bind,
        };
        let listener = if bind == self.bind {
            TcpListener::bind(bind).await?
        } else {
            match rebind(bind).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(%bind, error = %e, "previous port unavailable; picking a new one");
                    TcpListener::bind(self.bind).await?
                }
            }
        };
        let room_code = self.room_code_for(listener.local_addr()?);
        info!(room_code = %room_code, "listening for guests");

        let (tx, incoming) = mpsc::unbounded_channel();
        tokio::spawn(accept_guests(listener, tx));
        Ok(HostRegistration {
            room_code,
            incoming,
        })
    }

    async fn dial(&self, room_code: &str) -> Result<Box<dyn Link>> {
        if room_code.parse::<SocketAddr>().is_err() {
            return Err(room_not_found(room_code));
        }
        let link = WebSocketLink::connect(&format!("ws://{room_code}")).await?;
        Ok(Box::new(link))
    }
}

/// Bind `addr`, retrying briefly while a previous listener on it is released.
async fn rebind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < REBIND_ATTEMPTS => {
                debug!(%addr, attempt, error = %e, "port still taken; retrying");
                attempt += 1;
                tokio::time::sleep(REBIND_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Accept TCP connections until the registration is dropped.
async fn accept_guests(listener: TcpListener, tx: mpsc::UnboundedSender<IncomingGuest>) {
    loop {
        let (tcp, remote) = tokio::select! {
            _ = tx.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(tcp).await {
                Ok(stream) => {
                    let peer_id = generate_peer_id();
                    debug!(peer_id = %peer_id, %remote, "guest handshake complete");
                    let _ = tx.send(IncomingGuest {
                        peer_id,
                        link: Box::new(WebSocketLink::new(stream)),
                    });
                }
                Err(e) => debug!(%remote, error = %e, "guest handshake failed"),
            }
        });
    }
    debug!("stopped accepting guests");
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
    use crate::error::SyncError;

    fn loopback() -> DirectConnector {
        DirectConnector::new().with_bind_addr("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn wildcard_binds_advertise_loopback_or_the_configured_ip() {
        let local: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(DirectConnector::new().room_code_for(local), "127.0.0.1:4000");
        let lan: IpAddr = "192.168.1.20".parse().unwrap();
        assert_eq!(
            DirectConnector::new()
                .with_advertised_ip(lan)
                .room_code_for(local),
            "192.168.1.20:4000"
        );
    }

    #[tokio::test]
    async fn guest_reaches_host_by_room_code() {
        let connector = loopback();
        let mut registration = connector.host(None).await.unwrap();
        assert!(registration.room_code.starts_with("127.0.0.1:"));

        let mut guest = connector.dial(&registration.room_code).await.unwrap();
        let IncomingGuest { mut link, .. } = registration.incoming.recv().await.unwrap();

        guest.send(r#"{"type":"__PING"}"#.into()).await.unwrap();
        assert_eq!(link.recv().await.unwrap().unwrap(), r#"{"type":"__PING"}"#);
        link.send(r#"{"type":"__PONG"}"#.into()).await.unwrap();
        assert_eq!(guest.recv().await.unwrap().unwrap(), r#"{"type":"__PONG"}"#);
    }

    #[tokio::test]
    async fn refused_connection_is_retriable() {
        let connector = loopback();
        let registration = connector.host(None).await.unwrap();
        let code = registration.room_code.clone();
        drop(registration);
        // Let the accept loop notice and release the port.
        tokio::time::sleep(Duration::from_millis(50)).await;

        match connector.dial(&code).await {
            Err(e) => assert!(e.is_retriable(), "got {e:?}"),
            Ok(_) => panic!("nobody should be listening on {code}"),
        }
    }

    #[tokio::test]
    async fn malformed_code_is_room_not_found() {
        assert!(matches!(
            loopback().dial("not an address").await,
            Err(SyncError::RoomNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn re_registering_keeps_the_room_code() {
        let connector = loopback();
        let registration = connector.host(None).await.unwrap();
        let code = registration.room_code.clone();
        // Re-register right away, before the old listener is released.
        let released = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(registration);
        });

        let mut again = connector.host(Some(&code)).await.unwrap();
        released.await.unwrap();
        assert_eq!(again.room_code, code);

        let mut guest = connector.dial(&code).await.unwrap();
        let IncomingGuest { mut link, .. } = again.incoming.recv().await.unwrap();
        guest.send("rejoined".into()).await.unwrap();
        assert_eq!(link.recv().await.unwrap().unwrap(), "rejoined");
    }
}
