//! Handshake helpers: cache-busting tokens, handshake-body extraction,
//! and the URLs each dialect dials.

use crate::error::ProtocolError;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// URL-safe alphabet used by the polling cache-buster, ordered so encoded
/// timestamps sort the same as their numeric values.
const ALPHABET: &[u8; 64] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-_";

static SID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""sid":"([^"]+)""#).expect("valid regex"));
static NODE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"var nodeUrl\s?=\s?"https:\\/\\/([^:]+):(\d+)\\/socket\.io\\/socket\.io\.js""#)
        .expect("valid regex")
});

/// Encodes a millisecond timestamp into the compact token the current
/// dialect's polling handshake expects (`t=` query parameter).
pub fn yeast(mut num: i64) -> String {
    let mut encoded = String::new();
    while num > 0 {
        encoded.insert(0, ALPHABET[(num % 64) as usize] as char);
        num /= 64;
    }
    encoded
}

/// Pulls the websocket session id out of a current-dialect handshake body.
pub fn extract_sid(body: &str) -> Result<String, ProtocolError> {
    SID.captures(body)
        .map(|c| c[1].to_string())
        .ok_or(ProtocolError::Handshake("sid"))
}

/// Pulls the connection token out of a legacy handshake body
/// (`<token>:<heartbeat>:<close>:<transports>`).
pub fn extract_legacy_token(body: &str) -> Result<String, ProtocolError> {
    match body.split(':').next() {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(ProtocolError::Handshake("token")),
    }
}

/// Host and port of the realtime feed for one game server.
///
/// Discovered from the landing page, which embeds the feed's script URL in
/// an escaped inline assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub host: String,
    pub port: u16,
}

impl StreamEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Extracts the endpoint from a landing page, or `None` when the page
    /// does not advertise a feed.
    pub fn from_page(page: &str) -> Option<Self> {
        let caps = NODE_URL.captures(page)?;
        let port = caps[2].parse().ok()?;
        Some(Self::new(&caps[1], port))
    }

    /// Polling handshake URL (current dialect); `token` is a [`yeast`]
    /// timestamp.
    pub fn polling_url(&self, token: &str) -> String {
        format!(
            "https://{}:{}/socket.io/?EIO=4&transport=polling&t={token}",
            self.host, self.port
        )
    }

    /// Websocket URL for the sid issued by the polling handshake.
    pub fn websocket_url(&self, sid: &str) -> String {
        format!(
            "wss://{}:{}/socket.io/?EIO=4&transport=websocket&sid={sid}",
            self.host, self.port
        )
    }

    /// Handshake URL (legacy dialect); `millis` is a raw timestamp.
    pub fn legacy_polling_url(&self, millis: i64) -> String {
        format!("https://{}:{}/socket.io/1/?t={millis}", self.host, self.port)
    }

    /// Websocket URL for a legacy handshake token.
    pub fn legacy_websocket_url(&self, token: &str) -> String {
        format!(
            "wss://{}:{}/socket.io/1/websocket/{token}",
            self.host, self.port
        )
    }
}

impl fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
