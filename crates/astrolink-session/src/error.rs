//! Session error taxonomy.
//!
//! These are the domain errors every layer above speaks: the pipeline's
//! pre-checks, the retry wrapper's classification, and the login flow all
//! produce values of this type.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The bot is disabled; nothing runs until `enable` is called again.
    #[error("bot is not enabled")]
    Inactive,

    /// No session has been established yet (or `logout` tore it down).
    #[error("bot is not logged in")]
    LoggedOut,

    /// No game-server endpoint is configured; login has to happen first.
    #[error("server endpoint is not set")]
    EndpointUnset,

    /// The server silently invalidated the session. Absorbed by the retry
    /// wrapper, which re-authenticates; callers only see it once the
    /// retry budget is spent.
    #[error("session was invalidated by the server")]
    SessionLost,

    /// The lobby refuses this account. Never retried.
    #[error("account is blocked")]
    AccountBlocked,

    /// The lobby lists no universe with the configured name and language.
    /// Never retried.
    #[error("universe {universe} ({language}) not found")]
    UniverseNotFound { universe: String, language: String },

    /// No account matches the configured universe and language. Never
    /// retried.
    #[error("account not found")]
    AccountNotFound,

    /// The lobby rejected the credentials, or the landing page carried no
    /// session token. Never retried.
    #[error("bad credentials")]
    BadCredentials,

    /// The account has two-factor enabled and no OTP secret is configured.
    /// Never retried.
    #[error("otp required")]
    OtpRequired,

    /// The configured OTP secret produced a rejected code. Never retried.
    #[error("otp invalid")]
    OtpInvalid,

    /// The lobby demands a captcha and no solver is installed.
    #[error("captcha challenge required: {0}")]
    CaptchaRequired(String),

    /// Strict allocation mode: the caller asked for more than is
    /// available.
    #[error("requested {requested} but only {available} available")]
    AllocationExceeded { requested: i64, available: i64 },
}

impl SessionError {
    /// Authentication failures that abort any retry budget immediately:
    /// retrying cannot fix them and hammering the lobby gets accounts
    /// flagged.
    pub fn is_fatal_auth(&self) -> bool {
        matches!(
            self,
            SessionError::AccountBlocked
                | SessionError::UniverseNotFound { .. }
                | SessionError::AccountNotFound
                | SessionError::BadCredentials
                | SessionError::OtpRequired
                | SessionError::OtpInvalid
        )
    }
}
