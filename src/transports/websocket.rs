//! [`Link`] over a WebSocket stream using `tokio-tungstenite`.
//!
//! Shared by the direct and relay connectors. Works for both sides of a
//! connection: client streams from
//! [`connect_async`](tokio_tungstenite::connect_async) (`ws://` or `wss://`,
//! TLS handled via [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream)) and
//! server streams from [`accept_async`](tokio_tungstenite::accept_async).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, SyncError};
use crate::link::Link;

/// Byte stream under a client connection made by `connect_async`.
pub type ClientStream = tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>;

/// Byte stream under a server connection accepted by `accept_async` on plain TCP.
pub type ServerStream = tokio::net::TcpStream;

/// A [`Link`] carrying one JSON text frame per WebSocket text message.
///
/// # Cancel Safety
///
/// [`recv`](Link::recv) is cancel-safe: dropping it before completion does not
/// lose a message.
#[derive(Debug)]
pub struct WebSocketLink<S> {
    stream: WebSocketStream<S>,
    closed: bool,
}

impl<S> WebSocketLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

impl WebSocketLink<ClientStream> {
    /// Open a client connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Io`], preserving the I/O error kind when there is
    /// one so callers can tell a refused connection from other failures.
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::debug!(url = %url, "connecting WebSocket");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(into_io_error)?;
        tracing::debug!(url = %url, "WebSocket connected");
        Ok(Self::new(stream))
    }
}

pub(crate) fn into_io_error(e: tokio_tungstenite::tungstenite::Error) -> SyncError {
    let kind = match &e {
        tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
        _ => std::io::ErrorKind::Other,
    };
    SyncError::Io(std::io::Error::new(kind, e))
}

#[async_trait]
impl<S> Link for WebSocketLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: String) -> Result<()> {
        if self.closed {
            return Err(SyncError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| SyncError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(SyncError::TransportReceive(e.to_string()))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    tracing::warn!("skipping unexpected binary WebSocket frame");
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| SyncError::TransportSend(e.to_string()))
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
    use tokio::net::TcpListener;

    /// Accept one WebSocket on a local port and hand it to `handler`.
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(WebSocketStream<ServerStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{addr}")
    }

    #[test]
    fn links_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketLink<tokio::net::TcpStream>>();
    }

    #[tokio::test]
    async fn refused_connection_keeps_its_io_kind() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WebSocketLink::connect(&format!("ws://{addr}"))
            .await
            .unwrap_err();
        let SyncError::Io(io) = err else {
            panic!("expected an I/O error, got {err:?}");
        };
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn text_frames_flow_both_ways_and_binary_is_skipped() {
        let url = serve_once(|ws| async move {
            let mut link = WebSocketLink::new(ws);
            let incoming = link.recv().await.unwrap().unwrap();
            link.stream
                .send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            link.send(format!("echo:{incoming}")).await.unwrap();
            link.close().await.unwrap();
        })
        .await;

        let mut link = WebSocketLink::connect(&url).await.unwrap();
        link.send(r#"{"type":"__PING"}"#.into()).await.unwrap();
        assert_eq!(
            link.recv().await.unwrap().unwrap(),
            r#"echo:{"type":"__PING"}"#
        );
        assert!(link.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_later_sends() {
        let url = serve_once(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} }).await;

        let mut link = WebSocketLink::connect(&url).await.unwrap();
        link.close().await.unwrap();
        link.close().await.unwrap();
        assert!(matches!(
            link.send("late".into()).await,
            Err(SyncError::TransportClosed)
        ));
    }
}
