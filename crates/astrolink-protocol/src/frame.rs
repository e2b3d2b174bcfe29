//! Frame builders and parsers for both wire dialects.
//!
//! Outbound frames are plain strings; inbound frames parse into
//! [`CurrentFrame`] / [`LegacyFrame`] variants the stream driver matches
//! on. Parsing is ordered the way the official client dispatches, so a
//! frame that could satisfy two shapes resolves the same way it does in
//! production.

use crate::auction::AuctioneerEvent;
use crate::chat::{ChatMessage, ChatPayload};
use crate::error::ProtocolError;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::LazyLock;

/// Namespace carrying player chat.
pub const CHAT_NAMESPACE: &str = "chat";
/// Namespace carrying auction-house events.
pub const AUCTIONEER_NAMESPACE: &str = "auctioneer";

/// Upgrade probe sent immediately after the websocket opens (current dialect).
pub const PROBE: &str = "2probe";
/// Upgrade confirmation sent after the probe is acknowledged.
pub const UPGRADE: &str = "5";
/// Reply to a server ping.
pub const PONG: &str = "3";
/// Heartbeat echo (legacy dialect).
pub const LEGACY_HEARTBEAT: &str = "2::";

static CURRENT_AUCTIONEER_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"40/auctioneer,\{"sid":"[^"]+"\}"#).expect("valid regex"));
static CURRENT_CHAT_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"40/chat,\{"sid":"[^"]+"\}"#).expect("valid regex"));
static CURRENT_CHAT_ACK_OK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"43/chat,\d+\[true]").expect("valid regex"));
static CURRENT_CHAT_ACK_FAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"43/chat,\d+\[false]").expect("valid regex"));
static CURRENT_AUCTIONEER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+/auctioneer").expect("valid regex"));

static LEGACY_AUCTIONEER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+::/auctioneer").expect("valid regex"));
static LEGACY_CHAT_ACK_OK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"6::/chat:\d+\+\[true]").expect("valid regex"));
static LEGACY_CHAT_ACK_FAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"6::/chat:\d+\+\[false]").expect("valid regex"));

const CURRENT_CHAT_EVENT_PREFIX: &str = r#"42/chat,["chat","#;
const LEGACY_CHAT_EVENT_PREFIX: &str = "5::/chat:";
const LEGACY_AUCTIONEER_PREFIX: &str = "5::/auctioneer:";

/// Which framing generation the connected server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Colon-delimited multiplexed frames (`5:1+:/chat:{...}`).
    Legacy,
    /// Engine.io opcode frames (`42/chat,1[...]`).
    Current,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Legacy => write!(f, "legacy"),
            Dialect::Current => write!(f, "current"),
        }
    }
}

/// Subscribes to a namespace (current dialect).
pub fn current_subscribe(namespace: &str) -> String {
    format!("40/{namespace},")
}

/// Authorizes the chat namespace with the session token (current dialect).
/// `counter` is the per-session emitted-message counter.
pub fn current_authorize(counter: i64, session: &str) -> String {
    format!(r#"42/chat,{counter}["authorize","{session}"]"#)
}

/// Joins a namespace (legacy dialect).
pub fn legacy_join(namespace: &str) -> String {
    format!("1::/{namespace}")
}

/// Authorizes the chat namespace with the session token (legacy dialect).
pub fn legacy_authorize(counter: i64, session: &str) -> String {
    format!(r#"5:{counter}+:/chat:{{"name":"authorize","args":["{session}"]}}"#)
}

/// One parsed inbound frame in the current dialect.
#[derive(Debug, Clone, PartialEq)]
pub enum CurrentFrame {
    /// `3probe`: the upgrade probe was accepted.
    ProbeAck,
    /// `2`: server ping, answer with [`PONG`].
    Ping,
    /// The auctioneer namespace handed out its sid.
    AuctioneerOpen,
    /// The chat namespace handed out its sid; authorization should follow.
    ChatOpen,
    /// The server's verdict on the authorize call.
    ChatAuthAck { ok: bool },
    /// One chat message.
    ChatEvent(ChatMessage),
    /// One auctioneer event.
    Auctioneer(AuctioneerEvent),
    /// Anything unrecognized. The driver logs it and idles briefly.
    Other,
}

impl CurrentFrame {
    pub fn parse(frame: &str) -> Result<CurrentFrame, ProtocolError> {
        if frame == "3probe" {
            return Ok(CurrentFrame::ProbeAck);
        }
        if frame == "2" {
            return Ok(CurrentFrame::Ping);
        }
        if CURRENT_AUCTIONEER_OPEN.is_match(frame) {
            return Ok(CurrentFrame::AuctioneerOpen);
        }
        if CURRENT_CHAT_OPEN.is_match(frame) {
            return Ok(CurrentFrame::ChatOpen);
        }
        if CURRENT_CHAT_ACK_OK.is_match(frame) {
            return Ok(CurrentFrame::ChatAuthAck { ok: true });
        }
        if CURRENT_CHAT_ACK_FAIL.is_match(frame) {
            return Ok(CurrentFrame::ChatAuthAck { ok: false });
        }
        if let Some(payload) = frame.strip_prefix(CURRENT_CHAT_EVENT_PREFIX) {
            let payload = payload.strip_suffix(']').unwrap_or(payload);
            let msg: ChatMessage = serde_json::from_str(payload)?;
            return Ok(CurrentFrame::ChatEvent(msg));
        }
        if CURRENT_AUCTIONEER.is_match(frame) {
            let (_, payload) = frame
                .split_once(',')
                .ok_or_else(|| ProtocolError::MalformedFrame(frame.to_string()))?;
            return Ok(CurrentFrame::Auctioneer(decode_event_array(payload)?));
        }
        Ok(CurrentFrame::Other)
    }
}

/// One parsed inbound frame in the legacy dialect.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyFrame {
    /// `1::`: socket accepted, namespaces should be joined next.
    Connect,
    /// `1::/chat`: the chat namespace was joined; authorization should follow.
    ChatJoined,
    /// `2::`: heartbeat, echo [`LEGACY_HEARTBEAT`] back.
    Heartbeat,
    /// One auctioneer event (including the namespace-join echo, which the
    /// decoder passes through as [`AuctioneerEvent::Raw`]).
    Auctioneer(AuctioneerEvent),
    /// The server's verdict on the authorize call.
    ChatAuthAck { ok: bool },
    /// A batch of chat messages.
    ChatBatch(ChatPayload),
    /// Anything unrecognized. The driver logs it and idles briefly.
    Other,
}

impl LegacyFrame {
    pub fn parse(frame: &str) -> Result<LegacyFrame, ProtocolError> {
        if frame == "1::" {
            return Ok(LegacyFrame::Connect);
        }
        if frame == "1::/chat" {
            return Ok(LegacyFrame::ChatJoined);
        }
        if frame == "2::" {
            return Ok(LegacyFrame::Heartbeat);
        }
        if LEGACY_AUCTIONEER.is_match(frame) {
            let payload = frame.strip_prefix(LEGACY_AUCTIONEER_PREFIX).unwrap_or(frame);
            return Ok(LegacyFrame::Auctioneer(decode_named_event(payload)));
        }
        if LEGACY_CHAT_ACK_OK.is_match(frame) {
            return Ok(LegacyFrame::ChatAuthAck { ok: true });
        }
        if LEGACY_CHAT_ACK_FAIL.is_match(frame) {
            return Ok(LegacyFrame::ChatAuthAck { ok: false });
        }
        if let Some(payload) = frame.strip_prefix(LEGACY_CHAT_EVENT_PREFIX) {
            let parsed: ChatPayload = serde_json::from_str(payload)?;
            return Ok(LegacyFrame::ChatBatch(parsed));
        }
        Ok(LegacyFrame::Other)
    }
}

/// Current dialect carries events as a JSON array: `["name", arg]`.
fn decode_event_array(payload: &str) -> Result<AuctioneerEvent, ProtocolError> {
    let items: Vec<Value> = serde_json::from_str(payload).unwrap_or_default();
    if items.is_empty() {
        return Err(ProtocolError::MalformedFrame(payload.to_string()));
    }
    match items[0].as_str() {
        Some(name) => Ok(AuctioneerEvent::from_named(name, items.get(1), payload)),
        None => Ok(AuctioneerEvent::Raw(payload.to_string())),
    }
}

/// Legacy dialect carries events as `{"name":..., "args":[...]}`. Anything
/// that fails to decode passes through verbatim.
fn decode_named_event(payload: &str) -> AuctioneerEvent {
    let parsed: Value = serde_json::from_str(payload).unwrap_or(Value::Null);
    let name = parsed.get("name").and_then(Value::as_str);
    let args = parsed.get("args").and_then(Value::as_array);
    match (name, args) {
        (Some(name), Some(args)) if !args.is_empty() => {
            AuctioneerEvent::from_named(name, args.first(), payload)
        }
        _ => AuctioneerEvent::Raw(payload.to_string()),
    }
}
