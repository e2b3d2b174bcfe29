//! Transport error types.

use thiserror::Error;

/// Errors surfaced by feed connections.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint could not be reached or refused the websocket upgrade.
    #[error("failed to connect")]
    ConnectFailed(#[source] std::io::Error),

    /// The connection is no longer usable.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// A frame could not be sent.
    #[error("failed to send frame")]
    SendFailed(#[source] std::io::Error),

    /// A frame could not be received.
    #[error("failed to receive frame")]
    ReceiveFailed(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_connection_closed() {
        let err = TransportError::ConnectionClosed("peer went away".into());
        assert_eq!(err.to_string(), "connection closed: peer went away");
    }

    #[test]
    fn test_send_failed_preserves_source() {
        use std::error::Error as _;
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = TransportError::SendFailed(io);
        assert!(err.source().is_some());
    }
}
