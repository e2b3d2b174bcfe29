//! Wire protocol for the Astrolink realtime feed.
//!
//! The game servers have shipped two incompatible framings of their push
//! channel over the years, and both are still in the wild:
//!
//! - the **current** dialect: engine.io-style decimal opcodes with an HTTP
//!   polling handshake, a websocket upgrade probe, and JSON-array events
//!   (`42/chat,1["authorize","..."]`),
//! - the **legacy** dialect: colon-delimited multiplexed frames over a
//!   token handshake (`5:1+:/chat:{"name":"authorize","args":[...]}`).
//!
//! This crate is pure data. It knows how to build outbound frames, parse
//! inbound frames into typed values, and decode the chat / auctioneer
//! payloads they carry. No I/O happens here: the stream driver in the
//! `astrolink` crate owns sockets, deadlines, and reconnect policy, and
//! decides what to do with each parsed frame.

pub mod auction;
pub mod chat;
pub mod error;
pub mod frame;
pub mod handshake;

pub use auction::{AuctionPlayer, AuctioneerEvent};
pub use chat::{ChatMessage, ChatPayload};
pub use error::ProtocolError;
pub use frame::{CurrentFrame, Dialect, LegacyFrame};
pub use handshake::StreamEndpoint;
