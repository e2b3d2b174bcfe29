//! Unified error type for the Astrolink client.

use astrolink_protocol::ProtocolError;
use astrolink_queue::QueueError;
use astrolink_session::SessionError;
use astrolink_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `astrolink` meta-crate, you deal with this single
/// error type instead of importing errors from each sub-crate.
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so the `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum AstrolinkError {
    /// A protocol-level error (frame parse, handshake, payload shape).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A transport-level error (dial, send, recv, close).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A session-level error (lifecycle, auth, session loss).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A queue-level error (bot torn down while work was pending).
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// An HTTP error from the lobby or game server.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// A malformed URL (server endpoint or stream handshake).
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// The retry budget ran out; `source` is the last failure observed.
    #[error("operation failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<AstrolinkError>,
    },
}

impl AstrolinkError {
    /// Whether this failure means the server invalidated our session and a
    /// re-login should be attempted before the next try.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::Session(SessionError::SessionLost))
    }

    /// Whether this is an authentication failure that no amount of retrying
    /// will fix.
    pub fn is_fatal_auth(&self) -> bool {
        matches!(self, Self::Session(err) if err.is_fatal_auth())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::MalformedFrame("bad".into());
        let top: AstrolinkError = err.into();
        assert!(matches!(top, AstrolinkError::Protocol(_)));
        assert!(top.to_string().contains("bad"));
    }

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let top: AstrolinkError = err.into();
        assert!(matches!(top, AstrolinkError::Transport(_)));
        assert!(top.to_string().contains("gone"));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::LoggedOut;
        let top: AstrolinkError = err.into();
        assert!(matches!(top, AstrolinkError::Session(_)));
    }

    #[test]
    fn test_from_queue_error() {
        let err = QueueError::Inactive;
        let top: AstrolinkError = err.into();
        assert!(matches!(top, AstrolinkError::Queue(_)));
    }

    #[test]
    fn test_is_session_lost() {
        let lost: AstrolinkError = SessionError::SessionLost.into();
        assert!(lost.is_session_lost());
        let out: AstrolinkError = SessionError::LoggedOut.into();
        assert!(!out.is_session_lost());
    }

    #[test]
    fn test_is_fatal_auth() {
        let blocked: AstrolinkError = SessionError::AccountBlocked.into();
        assert!(blocked.is_fatal_auth());
        let lost: AstrolinkError = SessionError::SessionLost.into();
        assert!(!lost.is_fatal_auth());
        let queue: AstrolinkError = QueueError::Inactive.into();
        assert!(!queue.is_fatal_auth());
    }

    #[test]
    fn test_retries_exhausted_carries_source() {
        let err = AstrolinkError::RetriesExhausted {
            attempts: 10,
            source: Box::new(SessionError::SessionLost.into()),
        };
        assert!(err.to_string().contains("10 attempts"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
