//! WebSocket implementation of the feed transport.
//!
//! Wraps `tokio-tungstenite` behind the [`Dialer`] / [`Connection`] traits.
//! The feed speaks text frames; binary frames are decoded lossily rather
//! than dropped because older servers occasionally emit them for control
//! messages.

use crate::error::TransportError;
use crate::{Connection, ConnectionId, Dialer};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials real websocket endpoints, with TLS when the URL scheme asks for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketDialer;

impl Dialer for WebSocketDialer {
    type Connection = WebSocketConnection;
    type Error = TransportError;

    async fn dial(&self, url: &str) -> Result<WebSocketConnection, TransportError> {
        let (ws, _response) = connect_async(url).await.map_err(|e| {
            TransportError::ConnectFailed(io::Error::new(io::ErrorKind::ConnectionRefused, e))
        })?;
        let conn = WebSocketConnection::new(ws);
        debug!(id = %conn.id(), url, "feed connection established");
        Ok(conn)
    }
}

/// One live websocket connection to the feed.
#[derive(Debug)]
pub struct WebSocketConnection {
    id: ConnectionId,
    ws: Arc<Mutex<WsStream>>,
}

impl WebSocketConnection {
    fn new(ws: WsStream) -> Self {
        Self {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            ws: Arc::new(Mutex::new(ws)),
        }
    }
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        self.ws
            .lock()
            .await
            .send(Message::Text(frame.to_owned().into()))
            .await
            .map_err(|e| {
                TransportError::SendFailed(io::Error::new(io::ErrorKind::BrokenPipe, e))
            })
    }

    async fn recv(&self) -> Result<Option<String>, TransportError> {
        loop {
            let next = self.ws.lock().await.next().await;
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Ping/pong are handled by the library on flush.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.ws.lock().await.close(None).await {
            debug!(id = %self.id, error = %e, "close handshake failed");
        }
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
