//! Bot configuration: target universe, retry policy, allocation mode.

use std::time::Duration;

use astrolink_session::{Lobby, SessionError};
use tracing::warn;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// User agent sent with every lobby and game request unless overridden.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/104.0.0.0 Safari/537.36";

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry budget and backoff shape shared by the request pipeline and the
/// stream reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per wrapped call, including the first.
    pub max_attempts: u32,
    /// Wait before the first retry. Doubles after every failed attempt.
    pub base_delay: Duration,
    /// Ceiling the doubling wait saturates at.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Clamp out-of-range values so the policy is safe to use.
    ///
    /// `max_attempts` is raised to 1 (zero would mean "never try"), and a
    /// cap below the base delay is raised to the base delay.
    pub fn validated(mut self) -> Self {
        if self.max_attempts == 0 {
            warn!("retry max_attempts of 0 is not usable, raising to 1");
            self.max_attempts = 1;
        }
        if self.backoff_cap < self.base_delay {
            self.backoff_cap = self.base_delay;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// AllocationMode
// ---------------------------------------------------------------------------

/// How quantity requests larger than the available stock are resolved.
///
/// The remote service historically clamps silently; callers that prefer a
/// hard failure can opt into [`AllocationMode::Strict`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocationMode {
    /// Grant `min(requested, available)`.
    #[default]
    Lenient,
    /// Refuse with [`SessionError::AllocationExceeded`] when the request
    /// cannot be satisfied in full.
    Strict,
}

impl AllocationMode {
    /// Resolve a requested quantity against the available stock.
    pub fn allocate(self, requested: i64, available: i64) -> Result<i64, SessionError> {
        match self {
            Self::Lenient => Ok(requested.min(available)),
            Self::Strict if requested > available => Err(SessionError::AllocationExceeded {
                requested,
                available,
            }),
            Self::Strict => Ok(requested),
        }
    }
}

// ---------------------------------------------------------------------------
// BotConfig
// ---------------------------------------------------------------------------

/// Static configuration for one bot instance.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Universe (server) name, e.g. `"Zibal"`.
    pub universe: String,
    /// Community language code, e.g. `"en"`.
    pub language: String,
    /// Player id to select when the lobby account owns several players on
    /// the same server. 0 picks the first match.
    pub player_id: i64,
    /// Lobby cluster the account lives on.
    pub lobby: Lobby,
    /// User agent for lobby and game requests.
    pub user_agent: String,
    /// Retry/backoff policy for the pipeline and the stream client.
    pub retry: RetryPolicy,
    /// Quantity-allocation behavior for operations that spend stock.
    pub allocation: AllocationMode,
}

impl BotConfig {
    /// Configuration for `universe`/`language` with defaults everywhere else.
    pub fn new(universe: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            universe: universe.into(),
            language: language.into(),
            player_id: 0,
            lobby: Lobby::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry: RetryPolicy::default(),
            allocation: AllocationMode::default(),
        }
    }
}
