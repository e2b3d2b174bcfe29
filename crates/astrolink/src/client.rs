//! The client.
//!
//! [`Bot`] ties the stack together: one lobby identity, one game-server
//! session, one task queue serializing every session-touching operation,
//! and one realtime feed driver. Callers reach the operation surface
//! either directly (normal priority), through [`Bot::with_priority`], or
//! through a [`Transaction`] that holds the exclusive slot across several
//! calls.
//!
//! Every request that fails because the server silently swapped the
//! session for a login page is retried through an automatic re-login,
//! warm cookie jar first, full credentials as the fallback.

use crate::config::BotConfig;
use crate::error::AstrolinkError;
use crate::extract::{self, Extractor, Generation, MarkupExtractor};
use crate::lobby::{self, CaptchaSolver, GF_TOKEN_COOKIE, OtpGenerator};
use crate::pipeline::{
    self, AJAX_CHAT_PAGE, CallOptions, EventboxCounts, FETCH_EVENTBOX_PAGE, LOGOUT_PAGE,
    OVERVIEW_PAGE, PREFERENCES_PAGE, Query,
};
use crate::stream::{StreamContext, StreamDriver, StreamHandle, StreamObservers};
use astrolink_protocol::{AuctioneerEvent, ChatMessage, Dialect, ProtocolError, StreamEndpoint};
use astrolink_queue::{Permit, Priority, QueueHandle, TasksOverview, spawn_queue};
use astrolink_session::{
    Account, CharacterClass, Credentials, Lifecycle, OfficerSuite, Planet, Player, Preferences,
    Server, ServerData, SessionCache, SessionError, find_account,
};
use astrolink_transport::WebSocketDialer;
use futures_util::future::BoxFuture;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, Method, header, redirect};
use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};
use url::Url;

/// Game servers answer under `https://s{number}-{language}.<domain>`.
const GAME_DOMAIN: &str = "ogame.gameforge.com";

/// Root the lobby's auth cookie is filed under.
const ACCOUNT_COOKIE_URL: &str = "https://gameforge.com";

// ---------------------------------------------------------------------------
// Hooks and records
// ---------------------------------------------------------------------------

/// Everything one completed pipeline response looked like, as handed to
/// response interceptors.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub method: Method,
    pub url: String,
    pub query: Query,
    pub payload: Option<Query>,
    pub body: String,
}

/// Observer of completed pipeline responses. Each registered interceptor
/// runs on its own spawned task and cannot delay the caller.
pub type ResponseInterceptor = dyn Fn(&ResponseRecord) + Send + Sync;

/// Caller-installed wrapper around every login attempt, automatic
/// re-logins included. Useful for rate limiting and audit logging; the
/// wrapper decides if and when to await the inner future.
pub type LoginWrapper = dyn Fn(
        BoxFuture<'static, Result<bool, AstrolinkError>>,
    ) -> BoxFuture<'static, Result<bool, AstrolinkError>>
    + Send
    + Sync;

#[derive(Deserialize)]
struct ChatTokenEnvelope {
    #[serde(rename = "newToken", default)]
    new_token: String,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Bot`]. Credentials and universe selection are required
/// up front; hooks are optional.
pub struct BotBuilder {
    config: BotConfig,
    credentials: Credentials,
    captcha_solver: Option<Arc<dyn CaptchaSolver>>,
    otp_generator: Option<OtpGenerator>,
    login_wrapper: Option<Arc<LoginWrapper>>,
}

impl BotBuilder {
    pub fn new(config: BotConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
            captcha_solver: None,
            otp_generator: None,
            login_wrapper: None,
        }
    }

    /// Installs a solver for the lobby's image-drop challenge. Without
    /// one, a challenged login fails with
    /// [`SessionError::CaptchaRequired`].
    pub fn captcha_solver(mut self, solver: impl CaptchaSolver + 'static) -> Self {
        self.captcha_solver = Some(Arc::new(solver));
        self
    }

    /// Installs the generator that turns the OTP secret into the current
    /// one-time code at send time.
    pub fn otp_generator(
        mut self,
        generate: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.otp_generator = Some(Arc::new(generate));
        self
    }

    /// Installs a wrapper around every login attempt.
    pub fn login_wrapper(
        mut self,
        wrap: impl Fn(
            BoxFuture<'static, Result<bool, AstrolinkError>>,
        ) -> BoxFuture<'static, Result<bool, AstrolinkError>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.login_wrapper = Some(Arc::new(wrap));
        self
    }

    /// Builds the client, enabled and ready to log in. Spawns the task
    /// queue, so this must run inside a Tokio runtime.
    pub fn build(self) -> Result<Bot, AstrolinkError> {
        let mut config = self.config;
        config.retry = config.retry.validated();

        let jar = Arc::new(Jar::default());
        // The game client must observe login redirects as content instead
        // of following them; the lobby client follows its login link
        // through the whole redirect chain.
        let game_http = Client::builder()
            .user_agent(config.user_agent.clone())
            .cookie_provider(Arc::clone(&jar))
            .redirect(redirect::Policy::none())
            .build()?;
        let lobby_http = Client::builder()
            .user_agent(config.user_agent.clone())
            .cookie_provider(Arc::clone(&jar))
            .build()?;

        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.enable();
        let queue = spawn_queue(lifecycle.cancelled());

        let inner = BotInner {
            config,
            credentials: Mutex::new(self.credentials),
            lobby_http,
            game_http,
            jar,
            lifecycle,
            cache: Arc::new(SessionCache::new()),
            queue: Mutex::new(Some(queue)),
            extractor: Mutex::new(Arc::new(MarkupExtractor::new(Generation::default()))),
            dialect: Mutex::new(Dialect::Current),
            server_url: Mutex::new(String::new()),
            chat_counter: Arc::new(AtomicI64::new(1)),
            observers: Arc::new(StreamObservers::new()),
            stream: Mutex::new(None),
            stream_active: Arc::new(AtomicBool::new(false)),
            interceptors: Mutex::new(Vec::new()),
            captcha_solver: self.captcha_solver,
            otp_generator: self.otp_generator,
            login_wrapper: Mutex::new(self.login_wrapper),
        };
        Ok(Bot {
            inner: Arc::new(inner),
        })
    }
}

// ---------------------------------------------------------------------------
// The client
// ---------------------------------------------------------------------------

/// One automated session against one game server.
///
/// Cloning is cheap and shares the session: clones submit to the same
/// queue, read the same cached snapshot, and observe the same feed.
#[derive(Clone)]
pub struct Bot {
    inner: Arc<BotInner>,
}

struct BotInner {
    config: BotConfig,
    credentials: Mutex<Credentials>,
    /// Follows redirects; used for lobby API calls and the login link.
    lobby_http: Client,
    /// Never follows redirects; used for every game-server request.
    game_http: Client,
    jar: Arc<Jar>,
    lifecycle: Arc<Lifecycle>,
    cache: Arc<SessionCache>,
    queue: Mutex<Option<QueueHandle>>,
    extractor: Mutex<Arc<dyn Extractor>>,
    dialect: Mutex<Dialect>,
    server_url: Mutex<String>,
    /// Sequence number for feed authorize frames; reset to 1 per login.
    chat_counter: Arc<AtomicI64>,
    observers: Arc<StreamObservers>,
    stream: Mutex<Option<StreamHandle>>,
    /// Guards the one-driver-at-a-time rule for the feed.
    stream_active: Arc<AtomicBool>,
    interceptors: Mutex<Vec<Arc<ResponseInterceptor>>>,
    captcha_solver: Option<Arc<dyn CaptchaSolver>>,
    otp_generator: Option<OtpGenerator>,
    login_wrapper: Mutex<Option<Arc<LoginWrapper>>>,
}

impl Bot {
    pub fn builder(config: BotConfig, credentials: Credentials) -> BotBuilder {
        BotBuilder::new(config, credentials)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Re-enables a disabled client and spawns a fresh task queue.
    /// Enabling an already-enabled client changes nothing.
    pub fn enable(&self) {
        let inner = &self.inner;
        if inner.lifecycle.is_enabled() {
            return;
        }
        inner.lifecycle.enable();
        let queue = spawn_queue(inner.lifecycle.cancelled());
        *inner.queue.lock().unwrap_or_else(PoisonError::into_inner) = Some(queue);
    }

    /// Disables the client and fires the cancellation signal: queued
    /// tasks fail, retry waits abort, and the feed driver exits. The
    /// operation already holding the slot is left to finish.
    pub fn disable(&self) {
        self.inner.lifecycle.disable();
    }

    // -- introspection ------------------------------------------------------

    pub fn is_enabled(&self) -> bool {
        self.inner.lifecycle.is_enabled()
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.lifecycle.is_logged_in()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lifecycle.is_connected()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lifecycle.is_locked()
    }

    /// Lock flag plus the label of whoever last moved it.
    pub fn state(&self) -> (bool, String) {
        self.inner.lifecycle.state()
    }

    /// Snapshot of the queue: per-priority waiting counts and the name of
    /// the running task. Empty when the client is disabled.
    pub async fn tasks(&self) -> TasksOverview {
        let queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match queue {
            Some(queue) => queue.snapshot().await.unwrap_or_default(),
            None => TasksOverview::default(),
        }
    }

    // -- cached snapshot ----------------------------------------------------

    pub fn planets(&self) -> Vec<Planet> {
        self.inner.cache.planets()
    }

    pub fn planet_by_id(&self, id: i64) -> Option<Planet> {
        self.inner.cache.planet_by_id(id)
    }

    pub fn is_in_vacation(&self) -> bool {
        self.inner.cache.is_in_vacation()
    }

    pub fn character_class(&self) -> CharacterClass {
        self.inner.cache.character_class()
    }

    pub fn officers(&self) -> OfficerSuite {
        self.inner.cache.officers()
    }

    pub fn player(&self) -> Option<Player> {
        self.inner.cache.player()
    }

    pub fn preferences(&self) -> Preferences {
        self.inner.cache.preferences()
    }

    pub fn server_data(&self) -> Option<ServerData> {
        self.inner.cache.server_data()
    }

    /// Base URL of the game server, empty before the first login.
    pub fn server_url(&self) -> String {
        self.inner.server_url()
    }

    /// Applies the configured allocation mode to a requested amount
    /// against what is available.
    pub fn allocate(&self, requested: i64, available: i64) -> Result<i64, AstrolinkError> {
        Ok(self.inner.config.allocation.allocate(requested, available)?)
    }

    // -- observers ----------------------------------------------------------

    /// Observer of lock/unlock/enable/disable transitions, called
    /// synchronously with `(locked, actor)`.
    pub fn on_state_change(&self, observer: impl Fn(bool, &str) + Send + Sync + 'static) {
        self.inner.lifecycle.on_state_change(observer);
    }

    pub fn on_chat_message(&self, observer: impl Fn(ChatMessage) + Send + Sync + 'static) {
        self.inner.observers.on_chat_message(observer);
    }

    pub fn on_auctioneer_event(&self, observer: impl Fn(AuctioneerEvent) + Send + Sync + 'static) {
        self.inner.observers.on_auctioneer_event(observer);
    }

    /// Registers a raw feed-frame observer under `id`, replacing any
    /// previous observer with the same id.
    pub fn on_raw_frame(&self, id: impl Into<String>, observer: impl Fn(String) + Send + Sync + 'static) {
        self.inner.observers.on_raw_frame(id, observer);
    }

    pub fn remove_raw_frame(&self, id: &str) {
        self.inner.observers.remove_raw_frame(id);
    }

    /// Registers a response interceptor; see [`ResponseInterceptor`].
    pub fn on_response(&self, interceptor: impl Fn(&ResponseRecord) + Send + Sync + 'static) {
        self.inner
            .interceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(interceptor));
    }

    /// Installs or replaces the login wrapper; see [`LoginWrapper`].
    pub fn set_login_wrapper(
        &self,
        wrap: impl Fn(
            BoxFuture<'static, Result<bool, AstrolinkError>>,
        ) -> BoxFuture<'static, Result<bool, AstrolinkError>>
        + Send
        + Sync
        + 'static,
    ) {
        *self
            .inner
            .login_wrapper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(wrap));
    }

    // -- stream -------------------------------------------------------------

    /// Asks the feed driver to drop its socket and dial a fresh one.
    /// Returns false when no driver is running.
    pub fn reconnect_stream(&self) -> bool {
        self.inner.reconnect_stream()
    }

    // -- operations (normal priority) ---------------------------------------

    pub fn with_priority(&self, priority: Priority) -> Prioritized<'_> {
        Prioritized {
            bot: self,
            priority,
        }
    }

    /// Full lobby login with the configured credentials.
    pub async fn login(&self) -> Result<(), AstrolinkError> {
        self.with_priority(Priority::Normal).login().await
    }

    /// Logs in with a lobby bearer token. Returns true when the token
    /// carried an existing session; false means a full login ran instead.
    pub async fn login_with_bearer_token(&self, token: &str) -> Result<bool, AstrolinkError> {
        self.with_priority(Priority::Normal)
            .login_with_bearer_token(token)
            .await
    }

    /// Logs in from whatever the credential store or cookie jar already
    /// holds, falling back to a full login.
    pub async fn login_with_cookies(&self) -> Result<bool, AstrolinkError> {
        self.with_priority(Priority::Normal).login_with_cookies().await
    }

    /// Ends the session: best-effort logout request, then clears the
    /// logged-in flag and stops the feed driver.
    pub async fn logout(&self) -> Result<(), AstrolinkError> {
        self.with_priority(Priority::Normal).logout().await
    }

    pub async fn page_content(&self, query: Query) -> Result<String, AstrolinkError> {
        self.with_priority(Priority::Normal).page_content(query).await
    }

    pub async fn post_page_content(
        &self,
        query: Query,
        payload: Query,
    ) -> Result<String, AstrolinkError> {
        self.with_priority(Priority::Normal)
            .post_page_content(query, payload)
            .await
    }

    pub async fn fetch_eventbox(&self) -> Result<EventboxCounts, AstrolinkError> {
        self.with_priority(Priority::Normal).fetch_eventbox().await
    }

    pub async fn begin(&self) -> Result<Transaction<'_>, AstrolinkError> {
        self.with_priority(Priority::Normal).begin().await
    }

    pub async fn begin_named(&self, name: &str) -> Result<Transaction<'_>, AstrolinkError> {
        self.with_priority(Priority::Normal).begin_named(name).await
    }

    /// Runs `body` inside a transaction. The transaction is released when
    /// the returned future finishes, whether or not `body` called
    /// [`Transaction::done`].
    pub async fn tx<'a, T, F, Fut>(&'a self, body: F) -> Result<T, AstrolinkError>
    where
        F: FnOnce(Transaction<'a>) -> Fut,
        Fut: Future<Output = Result<T, AstrolinkError>>,
    {
        let tx = self.begin().await?;
        body(tx).await
    }
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("universe", &self.inner.config.universe)
            .field("language", &self.inner.config.language)
            .field("enabled", &self.inner.lifecycle.is_enabled())
            .field("logged_in", &self.inner.lifecycle.is_logged_in())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Priority surface
// ---------------------------------------------------------------------------

/// The operation surface bound to one priority level.
#[derive(Clone, Copy)]
pub struct Prioritized<'a> {
    bot: &'a Bot,
    priority: Priority,
}

impl<'a> Prioritized<'a> {
    pub async fn login(&self) -> Result<(), AstrolinkError> {
        let inner = &self.bot.inner;
        inner
            .run_exclusive(self.priority, "login", || inner.wrapped_login())
            .await
    }

    pub async fn login_with_bearer_token(&self, token: &str) -> Result<bool, AstrolinkError> {
        let inner = &self.bot.inner;
        let token = token.to_string();
        inner
            .run_exclusive(self.priority, "login", || {
                inner.wrapped_login_with_bearer(token)
            })
            .await
    }

    pub async fn login_with_cookies(&self) -> Result<bool, AstrolinkError> {
        let inner = &self.bot.inner;
        inner
            .run_exclusive(self.priority, "login", || {
                inner.wrapped_login_with_cookies()
            })
            .await
    }

    pub async fn logout(&self) -> Result<(), AstrolinkError> {
        let inner = &self.bot.inner;
        inner
            .run_exclusive(self.priority, "logout", || async {
                inner.logout().await;
                Ok(())
            })
            .await
    }

    pub async fn page_content(&self, query: Query) -> Result<String, AstrolinkError> {
        self.page_content_with(query, CallOptions::new()).await
    }

    pub async fn page_content_with(
        &self,
        query: Query,
        options: CallOptions,
    ) -> Result<String, AstrolinkError> {
        let inner = &self.bot.inner;
        let label = task_label(&Method::GET, &query);
        inner
            .run_exclusive(self.priority, &label, || {
                inner.fetch_page(Method::GET, query, None, options)
            })
            .await
    }

    pub async fn post_page_content(
        &self,
        query: Query,
        payload: Query,
    ) -> Result<String, AstrolinkError> {
        self.post_page_content_with(query, payload, CallOptions::new())
            .await
    }

    pub async fn post_page_content_with(
        &self,
        query: Query,
        payload: Query,
        options: CallOptions,
    ) -> Result<String, AstrolinkError> {
        let inner = &self.bot.inner;
        let label = task_label(&Method::POST, &query);
        inner
            .run_exclusive(self.priority, &label, || {
                inner.fetch_page(Method::POST, query, Some(payload), options)
            })
            .await
    }

    /// Polls the event box for hostile/neutral/friendly movement counts.
    pub async fn fetch_eventbox(&self) -> Result<EventboxCounts, AstrolinkError> {
        let inner = &self.bot.inner;
        inner
            .run_exclusive(self.priority, "fetch eventbox", || inner.fetch_eventbox())
            .await
    }

    pub async fn begin(&self) -> Result<Transaction<'a>, AstrolinkError> {
        self.begin_named("tx").await
    }

    /// Opens a transaction: acquires the slot at this priority and holds
    /// it until the returned handle is done or dropped.
    pub async fn begin_named(&self, name: &str) -> Result<Transaction<'a>, AstrolinkError> {
        let permit = self.bot.inner.acquire(self.priority, name).await?;
        self.bot.inner.lifecycle.lock(name);
        Ok(Transaction {
            bot: self.bot,
            permit: Some(permit),
            name: name.to_string(),
        })
    }
}

fn task_label(method: &Method, query: &Query) -> String {
    let page = query.page_name();
    if page.is_empty() {
        format!("{method} page")
    } else {
        format!("{method} {page}")
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// A held execution slot. Operations called on the handle run directly,
/// without re-queueing; everything else waits until the handle is done or
/// dropped.
pub struct Transaction<'a> {
    bot: &'a Bot,
    permit: Option<Permit>,
    name: String,
}

impl Transaction<'_> {
    pub async fn page_content(&self, query: Query) -> Result<String, AstrolinkError> {
        self.page_content_with(query, CallOptions::new()).await
    }

    pub async fn page_content_with(
        &self,
        query: Query,
        options: CallOptions,
    ) -> Result<String, AstrolinkError> {
        self.bot
            .inner
            .fetch_page(Method::GET, query, None, options)
            .await
    }

    pub async fn post_page_content(
        &self,
        query: Query,
        payload: Query,
    ) -> Result<String, AstrolinkError> {
        self.post_page_content_with(query, payload, CallOptions::new())
            .await
    }

    pub async fn post_page_content_with(
        &self,
        query: Query,
        payload: Query,
        options: CallOptions,
    ) -> Result<String, AstrolinkError> {
        self.bot
            .inner
            .fetch_page(Method::POST, query, Some(payload), options)
            .await
    }

    pub async fn fetch_eventbox(&self) -> Result<EventboxCounts, AstrolinkError> {
        self.bot.inner.fetch_eventbox().await
    }

    pub async fn login(&self) -> Result<(), AstrolinkError> {
        self.bot.inner.wrapped_login().await
    }

    pub async fn login_with_bearer_token(&self, token: &str) -> Result<bool, AstrolinkError> {
        self.bot
            .inner
            .wrapped_login_with_bearer(token.to_string())
            .await
    }

    pub async fn login_with_cookies(&self) -> Result<bool, AstrolinkError> {
        self.bot.inner.wrapped_login_with_cookies().await
    }

    pub async fn logout(&self) {
        self.bot.inner.logout().await;
    }

    /// Releases the slot. Dropping the handle does the same; this form
    /// just names the intent.
    pub fn done(self) {}
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.bot.inner.lifecycle.unlock(&self.name);
        // Dropping the permit wakes the queue.
        self.permit.take();
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("name", &self.name).finish()
    }
}

// ---------------------------------------------------------------------------
// Inner: scheduling
// ---------------------------------------------------------------------------

impl BotInner {
    async fn acquire(&self, priority: Priority, name: &str) -> Result<Permit, AstrolinkError> {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match queue {
            Some(queue) => Ok(queue.acquire(priority, name).await?),
            None => Err(SessionError::Inactive.into()),
        }
    }

    /// Runs `op` while holding the exclusive slot and the lock flag.
    async fn run_exclusive<T, F, Fut>(
        &self,
        priority: Priority,
        name: &str,
        op: F,
    ) -> Result<T, AstrolinkError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AstrolinkError>>,
    {
        let permit = self.acquire(priority, name).await?;
        self.lifecycle.lock(name);
        let outcome = op().await;
        self.lifecycle.unlock(name);
        permit.release();
        outcome
    }

    fn extractor(&self) -> Arc<dyn Extractor> {
        Arc::clone(&self.extractor.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn server_url(&self) -> String {
        self.server_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn bearer_token(&self) -> String {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bearer_token
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Inner: login flow
// ---------------------------------------------------------------------------

impl BotInner {
    fn wrapper(&self) -> Option<Arc<LoginWrapper>> {
        self.login_wrapper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_wrapped(
        &self,
        attempt: BoxFuture<'static, Result<bool, AstrolinkError>>,
    ) -> Result<bool, AstrolinkError> {
        match self.wrapper() {
            Some(wrap) => wrap(attempt).await,
            None => attempt.await,
        }
    }

    fn wrapped_login(self: &Arc<Self>) -> BoxFuture<'static, Result<(), AstrolinkError>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let inner = Arc::clone(&this);
            this.run_wrapped(Box::pin(async move {
                inner.login_full().await?;
                Ok(false)
            }))
            .await
            .map(|_| ())
        })
    }

    fn wrapped_login_with_bearer(
        self: &Arc<Self>,
        token: String,
    ) -> BoxFuture<'static, Result<bool, AstrolinkError>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let inner = Arc::clone(&this);
            this.run_wrapped(Box::pin(async move {
                inner.login_with_bearer_token(&token).await
            }))
            .await
        })
    }

    fn wrapped_login_with_cookies(
        self: &Arc<Self>,
    ) -> BoxFuture<'static, Result<bool, AstrolinkError>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let inner = Arc::clone(&this);
            this.run_wrapped(Box::pin(async move { inner.login_with_cookies().await }))
                .await
        })
    }

    /// Full credential exchange against the lobby, then into the game
    /// server via a fresh login link.
    async fn login_full(self: &Arc<Self>) -> Result<(), AstrolinkError> {
        debug!("creating lobby session");
        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let session = lobby::establish_session(
            &self.lobby_http,
            self.config.lobby,
            &credentials,
            self.otp_generator.as_ref(),
            self.captcha_solver.as_ref(),
        )
        .await?;
        self.store_bearer_token(&session.token)?;

        let (account, server) = self.login_part1(&session.token).await?;
        debug!("fetching login link");
        let link =
            lobby::fetch_login_link(&self.lobby_http, self.config.lobby, &account, &session.token)
                .await?;
        let html = self.exec_login_link(&link).await?;
        self.login_part2(&server);
        self.login_part3(&html).await
    }

    /// Resolves the configured universe to an account and server through
    /// the lobby listings.
    async fn login_part1(&self, token: &str) -> Result<(Account, Server), AstrolinkError> {
        let accounts = lobby::fetch_accounts(&self.lobby_http, self.config.lobby, token).await?;
        let servers = lobby::fetch_servers(&self.lobby_http, self.config.lobby).await?;
        let (account, server) = find_account(
            &self.config.universe,
            &self.config.language,
            self.config.player_id,
            &accounts,
            &servers,
        )?;
        if account.blocked {
            return Err(SessionError::AccountBlocked.into());
        }
        debug!(
            account = account.id,
            server = server.number,
            online = server.players_online,
            "lobby account resolved"
        );
        Ok((account.clone(), server.clone()))
    }

    /// Marks the session live and records which server it lives on.
    /// Logged-in flips first so the rest of the login passes the pipeline
    /// pre-checks.
    fn login_part2(&self, server: &Server) {
        self.lifecycle.set_logged_in(true);
        self.lifecycle.set_connected(true);
        self.cache.set_server_data(ServerData::from(server));
        // The lobby files "ba" communities under "yu"; hostnames go the
        // other way.
        let language = if server.language == "yu" {
            "ba"
        } else {
            server.language.as_str()
        };
        let url = format!("https://s{}-{}.{}", server.number, language, GAME_DOMAIN);
        debug!(server_url = %url, "game server selected");
        *self
            .server_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = url;
    }

    /// Digests the landing page: extractor generation, session token,
    /// snapshot priming, and the feed driver.
    async fn login_part3(self: &Arc<Self>, html: &str) -> Result<(), AstrolinkError> {
        match extract::page_version(html) {
            Some(version) => {
                let generation = Generation::for_version(&version);
                let dialect = version.dialect();
                debug!(%version, ?generation, %dialect, "server version detected");
                *self.extractor.lock().unwrap_or_else(PoisonError::into_inner) =
                    Arc::new(MarkupExtractor::new(generation));
                *self.dialect.lock().unwrap_or_else(PoisonError::into_inner) = dialect;
            }
            None => warn!("landing page carries no version marker; keeping current extractor"),
        }
        self.chat_counter.store(1, Ordering::Relaxed);

        let session = self.extractor().session(html).unwrap_or_default();
        if session.is_empty() {
            return Err(SessionError::BadCredentials.into());
        }
        self.cache_full_page(OVERVIEW_PAGE, html);

        // Warms the preferences cache; not fatal to the login.
        let preferences = Query::component(PREFERENCES_PAGE);
        if let Err(err) = self
            .fetch_page(Method::GET, preferences, None, CallOptions::new())
            .await
        {
            warn!(error = %err, "preferences warm-up fetch failed");
        }

        match self.extractor().stream_endpoint(html) {
            Some(endpoint) => self.spawn_stream(endpoint),
            None => warn!("landing page advertises no feed endpoint"),
        }
        Ok(())
    }

    /// Bearer-token login. True means the token carried a live session;
    /// false means it was unusable and a full login ran instead.
    async fn login_with_bearer_token(self: &Arc<Self>, token: &str) -> Result<bool, AstrolinkError> {
        if token.is_empty() {
            self.wrapped_login().await?;
            return Ok(false);
        }
        let (account, server) = match self.login_part1(token).await {
            Ok(resolved) => resolved,
            Err(err) if err.is_fatal_auth() => return Err(err),
            Err(err) => {
                warn!(error = %err, "bearer token rejected; falling back to full login");
                self.wrapped_login().await?;
                return Ok(false);
            }
        };
        self.login_part2(&server);

        let overview = Query::component(OVERVIEW_PAGE);
        let single = CallOptions::new().without_retry();
        let html = match self
            .fetch_page(Method::GET, overview.clone(), None, single)
            .await
        {
            Ok(html) => html,
            Err(err) if err.is_session_lost() => {
                debug!("stored session is stale; following a fresh login link");
                let link =
                    lobby::fetch_login_link(&self.lobby_http, self.config.lobby, &account, token)
                        .await?;
                let html = self.exec_login_link(&link).await?;
                if !extract::has_session_marker(&html) {
                    warn!("login link landed logged out; falling back to full login");
                    self.wrapped_login().await?;
                    return Ok(false);
                }
                html
            }
            Err(err) => return Err(err),
        };
        self.login_part3(&html).await?;
        Ok(true)
    }

    /// Re-login from stored state: the credential store's bearer token if
    /// set, otherwise whatever token the cookie jar still holds.
    async fn login_with_cookies(self: &Arc<Self>) -> Result<bool, AstrolinkError> {
        let mut token = self.bearer_token();
        if token.is_empty() {
            token = self.jar_token().unwrap_or_default();
        }
        self.login_with_bearer_token(&token).await
    }

    /// Keeps the lobby token in both stores so later warm logins work.
    fn store_bearer_token(&self, token: &str) -> Result<(), AstrolinkError> {
        let url = Url::parse(ACCOUNT_COOKIE_URL)?;
        self.jar.add_cookie_str(
            &format!("{GF_TOKEN_COOKIE}={token}; Domain=.gameforge.com; Path=/"),
            &url,
        );
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bearer_token = token.to_string();
        Ok(())
    }

    fn jar_token(&self) -> Option<String> {
        let url = Url::parse(ACCOUNT_COOKIE_URL).ok()?;
        let header = CookieStore::cookies(self.jar.as_ref(), &url)?;
        let header = header.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name == GF_TOKEN_COOKIE {
                Some(value.to_string())
            } else {
                None
            }
        })
    }

    /// Follows the one-shot login link through its redirect chain and
    /// returns the landing page.
    async fn exec_login_link(&self, link: &str) -> Result<String, AstrolinkError> {
        debug!("following login link");
        Ok(self
            .lobby_http
            .get(link)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }

    async fn logout(self: &Arc<Self>) {
        let query = Query::page(LOGOUT_PAGE);
        let single = CallOptions::new().without_retry();
        if let Err(err) = self.fetch_page(Method::GET, query, None, single).await {
            debug!(error = %err, "logout page fetch failed");
        }
        // Only the call that actually clears the flag tears the feed down.
        if self.lifecycle.clear_logged_in() {
            let handle = self
                .stream
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                handle.stop();
            }
            debug!("logged out");
        }
        self.lifecycle.set_connected(false);
    }
}

// ---------------------------------------------------------------------------
// Inner: request pipeline
// ---------------------------------------------------------------------------

impl BotInner {
    /// The request pipeline: pre-checks, payload shaping, then the call
    /// under the retry wrapper (unless the caller opted out).
    async fn fetch_page(
        self: &Arc<Self>,
        method: Method,
        mut query: Query,
        mut payload: Option<Query>,
        options: CallOptions,
    ) -> Result<String, AstrolinkError> {
        if !self.lifecycle.is_enabled() {
            return Err(SessionError::Inactive.into());
        }
        if !self.lifecycle.is_logged_in() {
            return Err(SessionError::LoggedOut.into());
        }
        if self.server_url().is_empty() {
            return Err(SessionError::EndpointUnset.into());
        }

        if let Some(id) = options.change_planet {
            self.prepare_change_planet(&mut query, id);
        }
        if let Some(payload) = payload.as_mut() {
            self.inject_chat_token(&query, payload);
        }

        if options.skip_retry {
            return self.execute(method, &query, payload.as_ref(), options).await;
        }
        let attempt = || {
            let inner = Arc::clone(self);
            let method = method.clone();
            let query = query.clone();
            let payload = payload.clone();
            async move { inner.execute(method, &query, payload.as_ref(), options).await }
        };
        let relogin = || -> BoxFuture<'static, Result<(), AstrolinkError>> {
            let inner = Arc::clone(self);
            Box::pin(async move { inner.wrapped_login_with_cookies().await.map(|_| ()) })
        };
        pipeline::with_retry(self.config.retry, &self.lifecycle, attempt, relogin).await
    }

    /// One attempt: send, classify, harvest, dispatch.
    async fn execute(
        self: &Arc<Self>,
        method: Method,
        query: &Query,
        payload: Option<&Query>,
        options: CallOptions,
    ) -> Result<String, AstrolinkError> {
        let url = self.request_url(query);
        let mut request = self.game_http.request(method.clone(), &url);
        if let Some(payload) = payload {
            request = request
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(payload.encode());
        }
        if pipeline::is_ajax_page(query) {
            request = request.header("X-Requested-With", "XMLHttpRequest");
        }

        let response = request.send().await?;
        if let Err(err) = response.error_for_status_ref() {
            if err.status().is_some_and(|status| status.is_server_error()) {
                return Err(err.into());
            }
        }
        let body = response.text().await?;

        if pipeline::detect_logged_out(query, &body) {
            warn!(page = query.page_name(), "response lacks a live session");
            self.lifecycle.set_connected(false);
            return Err(SessionError::SessionLost.into());
        }

        self.process_response(&method, query, payload, &body)?;
        if !options.skip_interceptors {
            self.dispatch_interceptors(method, url, query, payload, &body);
        }
        Ok(body)
    }

    fn request_url(&self, query: &Query) -> String {
        let server = self.server_url();
        match query.get("allianceId") {
            Some(id) if !id.is_empty() => {
                format!("{server}/game/allianceInfo.php?allianceId={id}")
            }
            _ => format!("{server}/game/index.php?{}", query.encode()),
        }
    }

    /// Switches the celestial context when the target is one of ours.
    fn prepare_change_planet(&self, query: &mut Query, id: i64) {
        if self.cache.planet_by_id(id).is_some() {
            query.set("cp", id.to_string());
        } else {
            warn!(celestial = id, "celestial not in cache; keeping current context");
        }
    }

    /// Chat posts must echo the token the server handed out last.
    fn inject_chat_token(&self, query: &Query, payload: &mut Query) {
        if query.page_name() == AJAX_CHAT_PAGE && payload.get("mode") == Some("1") {
            payload.set("token", self.cache.chat_token());
        }
    }

    /// Success-path harvesting before the body reaches the caller.
    fn process_response(
        &self,
        method: &Method,
        query: &Query,
        payload: Option<&Query>,
        body: &str,
    ) -> Result<(), AstrolinkError> {
        let page = query.page_name();
        if *method == Method::GET {
            if !pipeline::is_ajax_page(query)
                && !pipeline::is_empire_page(query)
                && extract::has_session_marker(body)
            {
                self.cache_full_page(page, body);
            }
        } else if *method == Method::POST {
            if page == PREFERENCES_PAGE {
                self.cache.set_preferences(self.extractor().preferences(body));
            } else if page == AJAX_CHAT_PAGE {
                self.capture_chat_token(payload, body)?;
            }
        }
        Ok(())
    }

    /// Refreshes the cached snapshot from one authenticated full page.
    fn cache_full_page(&self, page: &str, html: &str) {
        let extractor = self.extractor();
        self.cache.apply_page(extractor.page_update(html));
        if page == OVERVIEW_PAGE {
            if let Some(player) = extractor.player(html) {
                self.cache.set_player(player);
            }
        }
        if page == PREFERENCES_PAGE {
            self.cache.set_preferences(extractor.preferences(html));
        }
    }

    fn capture_chat_token(
        &self,
        payload: Option<&Query>,
        body: &str,
    ) -> Result<(), AstrolinkError> {
        let mode = payload.and_then(|p| p.get("mode")).unwrap_or("");
        if mode != "1" && mode != "3" {
            return Ok(());
        }
        let envelope: ChatTokenEnvelope =
            serde_json::from_str(body).map_err(ProtocolError::from)?;
        self.cache.set_chat_token(envelope.new_token);
        Ok(())
    }

    fn dispatch_interceptors(
        &self,
        method: Method,
        url: String,
        query: &Query,
        payload: Option<&Query>,
        body: &str,
    ) {
        let interceptors = self
            .interceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if interceptors.is_empty() {
            return;
        }
        let record = Arc::new(ResponseRecord {
            method,
            url,
            query: query.clone(),
            payload: payload.cloned(),
            body: body.to_string(),
        });
        for interceptor in interceptors {
            let record = Arc::clone(&record);
            tokio::spawn(async move { interceptor(&record) });
        }
    }

    /// Typed JSON fetch with its own retry layer. The inner page fetch
    /// runs single-attempt so one failure costs one unit of this budget,
    /// not a nested budget of its own.
    async fn fetch_json<T>(self: &Arc<Self>, query: Query) -> Result<T, AstrolinkError>
    where
        T: serde::de::DeserializeOwned,
    {
        let attempt = || {
            let inner = Arc::clone(self);
            let query = query.clone();
            async move {
                let body = inner
                    .fetch_page(Method::GET, query, None, CallOptions::new().without_retry())
                    .await?;
                match serde_json::from_str::<T>(&body) {
                    Ok(value) => Ok(value),
                    // A substituted login page is the usual cause.
                    Err(err) => {
                        warn!(error = %err, "structured response failed to parse");
                        inner.lifecycle.set_connected(false);
                        Err(SessionError::SessionLost.into())
                    }
                }
            }
        };
        let relogin = || -> BoxFuture<'static, Result<(), AstrolinkError>> {
            let inner = Arc::clone(self);
            Box::pin(async move { inner.wrapped_login_with_cookies().await.map(|_| ()) })
        };
        pipeline::with_retry(self.config.retry, &self.lifecycle, attempt, relogin).await
    }

    async fn fetch_eventbox(self: &Arc<Self>) -> Result<EventboxCounts, AstrolinkError> {
        let query = Query::page(FETCH_EVENTBOX_PAGE)
            .with("ajax", "1")
            .with("asJson", "1");
        self.fetch_json(query).await
    }
}

// ---------------------------------------------------------------------------
// Inner: stream
// ---------------------------------------------------------------------------

impl BotInner {
    /// Starts the feed driver for this login, or redials the one already
    /// running so it picks up the fresh session.
    fn spawn_stream(self: &Arc<Self>, endpoint: StreamEndpoint) {
        if self
            .stream_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.reconnect_stream();
            return;
        }
        let context = StreamContext {
            endpoint,
            dialect: *self.dialect.lock().unwrap_or_else(PoisonError::into_inner),
            policy: self.config.retry,
            cache: Arc::clone(&self.cache),
            counter: Arc::clone(&self.chat_counter),
            observers: Arc::clone(&self.observers),
            cancelled: self.lifecycle.cancelled(),
        };
        let (driver, handle) = StreamDriver::new(WebSocketDialer, self.game_http.clone(), context);
        *self.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        let active = Arc::clone(&self.stream_active);
        tokio::spawn(async move {
            driver.run().await;
            active.store(false, Ordering::SeqCst);
        });
    }

    fn reconnect_stream(&self) -> bool {
        let guard = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(handle) => handle.reconnect(),
            None => {
                error!("no feed driver to reconnect");
                false
            }
        }
    }
}
