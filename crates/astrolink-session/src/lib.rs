//! Session state for the Astrolink client.
//!
//! Three concerns live here, all shared across the bot's tasks:
//!
//! - [`Lifecycle`]: the enabled / logged-in / connected / locked flags,
//!   the per-enable cancellation signal, and state-change observers,
//! - account vocabulary: [`Credentials`], lobby [`Account`] / [`Server`]
//!   records and the logic that joins them,
//! - [`SessionCache`]: the read-mostly snapshot harvested from full-page
//!   responses (planets, preferences, tokens, perks).
//!
//! Everything is synchronous and lock-cheap; async coordination (queues,
//! retries, sockets) belongs to the other crates.

pub mod account;
pub mod cache;
pub mod error;
pub mod state;

pub use account::{
    Account, AccountServer, Credentials, Lobby, Server, ServerData, ServerSettings, find_account,
    find_server,
};
pub use cache::{
    CharacterClass, Coordinate, Moon, OfficerSuite, PageUpdate, Planet, Player, Preferences,
    SessionCache,
};
pub use error::SessionError;
pub use state::Lifecycle;
