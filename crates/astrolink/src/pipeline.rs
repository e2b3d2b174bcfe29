//! Request shaping, session-loss classification, and the retry wrapper.
//!
//! The game server never answers an expired session with a status code.
//! It silently substitutes the login page, so every response has to be
//! inspected against the kind of content the request should have
//! produced. The rules live here, pure and synchronous; the HTTP side
//! is in [`crate::client`].

use std::future::Future;

use astrolink_session::{Lifecycle, SessionError};
use serde::Deserialize;
use tracing::{error, warn};

use crate::config::RetryPolicy;
use crate::error::AstrolinkError;
use crate::extract;

// ---------------------------------------------------------------------------
// Page names
// ---------------------------------------------------------------------------

pub const OVERVIEW_PAGE: &str = "overview";
pub const PREFERENCES_PAGE: &str = "preferences";
pub const LOGOUT_PAGE: &str = "logout";
pub const AJAX_CHAT_PAGE: &str = "ajaxChat";
pub const FETCH_EVENTBOX_PAGE: &str = "fetchEventbox";
pub const EVENT_LIST_PAGE: &str = "eventList";
pub const GALAXY_CONTENT_PAGE: &str = "galaxyContent";

/// Navigation pages that always render the full authenticated chrome,
/// session marker included.
const KNOWN_FULL_PAGES: &[&str] = &[
    "overview",
    "traderOverview",
    "research",
    "shipyard",
    "galaxy",
    "alliance",
    "premium",
    "shop",
    "rewards",
    "resourceSettings",
    "movement",
    "highscore",
    "buddies",
    "preferences",
    "messages",
    "chat",
    "defenses",
    "supplies",
    "facilities",
    "fleetdispatch",
];

/// Partial endpoints that answer with fragments or JSON instead of a
/// full page.
const AJAX_PAGES: &[&str] = &[
    "fetchEventbox",
    "fetchResources",
    "galaxyContent",
    "eventList",
    "ajaxChat",
    "notices",
    "repairlayer",
    "techtree",
    "phalanx",
    "shareReportOverlay",
    "jumpgatelayer",
    "federationlayer",
    "unionchange",
    "changenick",
    "planetlayer",
    "traderlayer",
    "planetRename",
    "rightmenu",
    "allianceOverview",
    "support",
    "buffActivation",
    "auctioneer",
    "highscoreContent",
];

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Ordered query parameters for one game request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query for a standard in-game component (`page=ingame&component=…`).
    pub fn component(name: &str) -> Self {
        Self::new().with("page", "ingame").with("component", name)
    }

    /// Query for a bare `page=<name>` request (ajax endpoints, logout).
    pub fn page(name: &str) -> Self {
        Self::new().with("page", name)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets a parameter, replacing any previous value for the key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(existing, _)| *existing == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    /// Resolved page name used for classification. In-game requests and
    /// the component-only wrappers answer for their component, not the
    /// wrapper page.
    pub fn page_name(&self) -> &str {
        let page = self.get("page").unwrap_or("");
        let component = self.get("component").unwrap_or("");
        if page == "ingame"
            || (page == "componentOnly" && component == FETCH_EVENTBOX_PAGE)
            || (page == "componentOnly"
                && component == EVENT_LIST_PAGE
                && self.get("action") != Some("fetchEventBox"))
        {
            component
        } else {
            page
        }
    }

    /// Form-encodes the parameters in insertion order.
    pub fn encode(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.pairs {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }
}

// ---------------------------------------------------------------------------
// Call options
// ---------------------------------------------------------------------------

/// Per-call tweaks to the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Run the request once instead of under the retry wrapper.
    pub skip_retry: bool,
    /// Do not dispatch response interceptors for this call.
    pub skip_interceptors: bool,
    /// Ask the server to switch to this celestial before answering.
    pub change_planet: Option<i64>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_retry(mut self) -> Self {
        self.skip_retry = true;
        self
    }

    pub fn without_interceptors(mut self) -> Self {
        self.skip_interceptors = true;
        self
    }

    pub fn on_celestial(mut self, id: i64) -> Self {
        self.change_planet = Some(id);
        self
    }
}

// ---------------------------------------------------------------------------
// Session-loss classification
// ---------------------------------------------------------------------------

/// Threat counts from the event box poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventboxCounts {
    pub hostile: i64,
    pub neutral: i64,
    pub friendly: i64,
}

pub fn is_known_full_page(page: &str) -> bool {
    KNOWN_FULL_PAGES.contains(&page)
}

pub fn is_ajax_page(query: &Query) -> bool {
    let page = query.get("page").unwrap_or("");
    let component = query.get("component").unwrap_or("");
    AJAX_PAGES.contains(&page)
        || AJAX_PAGES.contains(&component)
        || query.get("ajax") == Some("1")
        || query.get("asJson") == Some("1")
}

pub fn is_empire_page(query: &Query) -> bool {
    query.get("page") == Some("standalone") && query.get("component") == Some("empire")
}

fn parses_as_eventbox(body: &str) -> bool {
    serde_json::from_str::<EventboxCounts>(body).is_ok()
}

/// A galaxy poll answers with a JSON object; a substituted login page
/// does not.
fn parses_as_galaxy_payload(body: &str) -> bool {
    serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(body).is_ok()
}

/// Content-based session-loss detection.
///
/// Full pages must carry the session marker; list and structured
/// partials must look like what the endpoint produces when logged in.
/// Alliance detail requests work logged out and are exempt.
pub fn detect_logged_out(query: &Query, body: &str) -> bool {
    if query.get("allianceId").is_some_and(|id| !id.is_empty()) {
        return false;
    }
    let page = query.page_name();
    (page != LOGOUT_PAGE
        && (is_known_full_page(page) || page.is_empty())
        && !is_ajax_page(query)
        && !extract::has_session_marker(body))
        || (page == EVENT_LIST_PAGE && !body.contains("eventListWrap"))
        || (page == FETCH_EVENTBOX_PAGE && !parses_as_eventbox(body))
        || (page == GALAXY_CONTENT_PAGE && !parses_as_galaxy_payload(body))
}

// ---------------------------------------------------------------------------
// Retry wrapper
// ---------------------------------------------------------------------------

/// Runs `attempt` until it succeeds or the budget gives out, waiting
/// `min(base·2ⁿ, cap)` between failures, or less if cancellation fires
/// first. A session-loss failure triggers `relogin` before the next
/// attempt; a fatal auth error from the re-login aborts the whole budget.
pub async fn with_retry<T, A, FutA, R, FutR>(
    policy: RetryPolicy,
    lifecycle: &Lifecycle,
    mut attempt: A,
    mut relogin: R,
) -> Result<T, AstrolinkError>
where
    A: FnMut() -> FutA,
    FutA: Future<Output = Result<T, AstrolinkError>>,
    R: FnMut() -> FutR,
    FutR: Future<Output = Result<(), AstrolinkError>>,
{
    let policy = policy.validated();
    let mut remaining = policy.max_attempts;
    let mut wait = policy.base_delay;
    let mut cancelled = lifecycle.cancelled();

    loop {
        let err = match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        // A manual disable or logout mid-flight is not retryable.
        if !lifecycle.is_enabled() {
            return Err(SessionError::Inactive.into());
        }
        if !lifecycle.is_logged_in() {
            return Err(SessionError::LoggedOut.into());
        }

        remaining -= 1;
        if remaining == 0 {
            return Err(AstrolinkError::RetriesExhausted {
                attempts: policy.max_attempts,
                source: Box::new(err),
            });
        }

        warn!(error = %err, wait = ?wait, remaining, "request failed, backing off");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancelled.wait_for(|flag| *flag) => {
                return Err(SessionError::Inactive.into());
            }
        }
        wait = (wait * 2).min(policy.backoff_cap);

        if err.is_session_lost() {
            if let Err(login_err) = relogin().await {
                error!(error = %login_err, "automatic re-login failed");
                if login_err.is_fatal_auth() {
                    return Err(login_err);
                }
            }
        }
    }
}
