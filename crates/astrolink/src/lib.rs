//! # Astrolink
//!
//! Automation client for one authenticated session against an OGame
//! server.
//!
//! The client logs in through the publisher lobby, keeps a cached
//! snapshot of the account (planets, preferences, tokens), serializes
//! every server-touching operation through a priority queue, retries
//! failed requests with automatic re-login, and follows the server's
//! realtime chat/auctioneer feed over a websocket.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use astrolink::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AstrolinkError> {
//!     astrolink::init_tracing();
//!
//!     let bot = Bot::builder(
//!         BotConfig::new("Zibal", "en"),
//!         Credentials::new("pilot@example.com", "hunter2"),
//!     )
//!     .build()?;
//!
//!     bot.login().await?;
//!     tracing::info!(planets = bot.planets().len(), "session ready");
//!
//!     let movements = bot.fetch_eventbox().await?;
//!     if movements.hostile > 0 {
//!         tracing::warn!(hostile = movements.hostile, "incoming fleets");
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod lobby;
pub mod pipeline;
pub mod stream;

pub use client::{Bot, BotBuilder, LoginWrapper, Prioritized, ResponseRecord, Transaction};
pub use config::{AllocationMode, BotConfig, RetryPolicy};
pub use error::AstrolinkError;
pub use extract::{Extractor, Generation, MarkupExtractor, Version};
pub use lobby::{CaptchaSolver, OtpGenerator};
pub use pipeline::{CallOptions, EventboxCounts, Query};
pub use stream::StreamObservers;

pub use astrolink_protocol::{AuctioneerEvent, ChatMessage, Dialect, StreamEndpoint};
pub use astrolink_queue::{Priority, TasksOverview};
pub use astrolink_session::{
    Account, CharacterClass, Coordinate, Credentials, Lifecycle, Lobby, Moon, OfficerSuite,
    Planet, Player, Preferences, Server, ServerData, SessionCache, SessionError,
};

/// The types most programs need, importable in one line.
pub mod prelude {
    pub use crate::client::{Bot, BotBuilder, ResponseRecord, Transaction};
    pub use crate::config::{AllocationMode, BotConfig, RetryPolicy};
    pub use crate::error::AstrolinkError;
    pub use crate::pipeline::{CallOptions, EventboxCounts, Query};
    pub use astrolink_protocol::{AuctioneerEvent, ChatMessage};
    pub use astrolink_queue::Priority;
    pub use astrolink_session::{Credentials, Planet, SessionError};
}

/// Installs a process-wide `tracing` subscriber reading `RUST_LOG`, with
/// `info` as the fallback level. Safe to call more than once; only the
/// first call wins.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
