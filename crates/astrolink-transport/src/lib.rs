//! Client-side transport abstraction for the realtime feed.
//!
//! The stream driver in the `astrolink` crate is generic over these traits
//! so its dialect logic can be exercised against scripted in-memory
//! connections, while production dials real TLS websockets through
//! [`websocket::WebSocketDialer`].

#![allow(async_fn_in_trait)]

pub mod error;
pub mod websocket;

pub use error::TransportError;
pub use websocket::{WebSocketConnection, WebSocketDialer};

use std::fmt;

/// Identifies one feed connection for log correlation across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Opens feed connections. One implementation dials real websockets; tests
/// substitute scripted ones.
pub trait Dialer: Send + Sync {
    type Connection: Connection;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establishes a connection to `url` (a `ws://` or `wss://` endpoint).
    async fn dial(&self, url: &str) -> Result<Self::Connection, Self::Error>;
}

/// A single established feed connection carrying text frames.
pub trait Connection: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sends one frame.
    async fn send(&self, frame: &str) -> Result<(), Self::Error>;

    /// Receives the next frame. Returns `Ok(None)` once the peer has
    /// closed; transport failures surface as `Err`.
    async fn recv(&self) -> Result<Option<String>, Self::Error>;

    /// Closes the connection. Safe to call more than once.
    async fn close(&self);

    /// Identifier for logging.
    fn id(&self) -> ConnectionId;
}
