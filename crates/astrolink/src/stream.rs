//! Realtime feed driver.
//!
//! Owns the persistent socket to the chat/auctioneer feed: the HTTP
//! handshake, the websocket dial, frame dispatch, and redialing after a
//! drop. The driver runs as one spawned task per login generation and
//! keeps reconnecting until the client logs out or shuts down.
//!
//! Reconnect pacing follows the handshake, not the socket: a successful
//! handshake resets the backoff, so a freshly dropped connection redials
//! immediately and only repeated handshake failures slow down.

use crate::config::RetryPolicy;
use crate::error::AstrolinkError;
use astrolink_protocol::frame::{self, CurrentFrame, Dialect, LegacyFrame};
use astrolink_protocol::handshake::yeast;
use astrolink_protocol::{AuctioneerEvent, ChatMessage, StreamEndpoint};
use astrolink_session::SessionCache;
use astrolink_transport::{Connection, Dialer, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

/// How long one read may sit idle before control returns to the loop to
/// check for shutdown and commands.
const READ_DEADLINE: Duration = Duration::from_secs(1);

/// Pause after an unrecognized frame so a confused server cannot spin the
/// loop at full speed.
const UNKNOWN_FRAME_PAUSE: Duration = Duration::from_secs(1);

const COMMAND_BUFFER: usize = 8;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Doubling retry delay with an instant first attempt.
///
/// `next_delay` returns [`Duration::ZERO`] the first time after a reset,
/// then the base delay, then doubles up to the cap. Callers reset it when
/// the endpoint proves reachable again.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Option<Duration>,
    base: Duration,
    cap: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            current: None,
            base,
            cap,
        }
    }

    /// Hands out the next delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        match self.current {
            None => {
                self.current = Some(self.base);
                Duration::ZERO
            }
            Some(delay) => {
                self.current = Some((delay * 2).min(self.cap));
                delay
            }
        }
    }

    /// Makes the next attempt instant again.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

pub type ChatObserver = dyn Fn(ChatMessage) + Send + Sync;
pub type AuctioneerObserver = dyn Fn(AuctioneerEvent) + Send + Sync;
pub type RawObserver = dyn Fn(String) + Send + Sync;

/// Observer registries the feed fans out to.
///
/// Registration works at any time, connected or not, and survives redials
/// and re-logins: the registry belongs to the client, not to any one
/// connection. Raw observers see every inbound frame before parsing. Every
/// observer call runs on its own spawned task so a slow callback cannot
/// stall the read loop or delay heartbeat replies.
#[derive(Default)]
pub struct StreamObservers {
    chat: Mutex<Vec<Arc<ChatObserver>>>,
    auctioneer: Mutex<Vec<Arc<AuctioneerObserver>>>,
    raw: Mutex<HashMap<String, Arc<RawObserver>>>,
}

impl StreamObservers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for every decoded chat message.
    pub fn on_chat_message(&self, observer: impl Fn(ChatMessage) + Send + Sync + 'static) {
        self.chat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Registers an observer for every decoded auctioneer event.
    pub fn on_auctioneer_event(&self, observer: impl Fn(AuctioneerEvent) + Send + Sync + 'static) {
        self.auctioneer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Registers a raw-frame observer under a caller-chosen id, replacing
    /// any previous observer with the same id.
    pub fn on_raw_frame(
        &self,
        id: impl Into<String>,
        observer: impl Fn(String) + Send + Sync + 'static,
    ) {
        self.raw
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), Arc::new(observer));
    }

    /// Drops the raw-frame observer registered under `id`, if any.
    pub fn remove_raw_frame(&self, id: &str) {
        self.raw
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn dispatch_chat(&self, message: ChatMessage) {
        let observers: Vec<Arc<ChatObserver>> = self
            .chat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            let message = message.clone();
            tokio::spawn(async move { observer(message) });
        }
    }

    fn dispatch_auctioneer(&self, event: AuctioneerEvent) {
        let observers: Vec<Arc<AuctioneerObserver>> = self
            .auctioneer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            let event = event.clone();
            tokio::spawn(async move { observer(event) });
        }
    }

    fn dispatch_raw(&self, frame: &str) {
        let observers: Vec<Arc<RawObserver>> = self
            .raw
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for observer in observers {
            let frame = frame.to_owned();
            tokio::spawn(async move { observer(frame) });
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Control messages the client can send a running driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    /// Drop the current socket and dial a fresh one.
    Reconnect,
}

/// Client-side handle to a running feed driver.
pub struct StreamHandle {
    commands: mpsc::Sender<StreamCommand>,
    stop: watch::Sender<bool>,
}

impl StreamHandle {
    /// Asks the driver to drop its socket and dial a fresh one. Returns
    /// `false` when the driver is gone or too far behind to accept it.
    pub fn reconnect(&self) -> bool {
        self.commands.try_send(StreamCommand::Reconnect).is_ok()
    }

    /// Stops the driver for good. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Everything a feed driver needs from the surrounding client.
pub struct StreamContext {
    /// Feed endpoint advertised by the landing page.
    pub endpoint: StreamEndpoint,
    /// Framing generation the server speaks.
    pub dialect: Dialect,
    /// Backoff shape for redials.
    pub policy: RetryPolicy,
    /// Cache the authorize frame reads its session token from.
    pub cache: Arc<SessionCache>,
    /// Emitted-message counter, shared so a fresh login restarts it.
    pub counter: Arc<AtomicI64>,
    /// Registries decoded events fan out to.
    pub observers: Arc<StreamObservers>,
    /// Fires when the whole client shuts down.
    pub cancelled: watch::Receiver<bool>,
}

/// Why a live connection stopped pumping frames.
#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    /// Shutdown was requested; the outer loop must not redial.
    Stop,
    /// A reconnect was requested; the outer loop dials again.
    Redial,
}

/// One feed connection's driver: dials, authorizes, pumps frames, redials.
pub struct StreamDriver<D: Dialer> {
    dialer: D,
    http: reqwest::Client,
    endpoint: StreamEndpoint,
    dialect: Dialect,
    cache: Arc<SessionCache>,
    counter: Arc<AtomicI64>,
    observers: Arc<StreamObservers>,
    backoff: ExponentialBackoff,
    commands: mpsc::Receiver<StreamCommand>,
    stop: watch::Receiver<bool>,
    cancelled: watch::Receiver<bool>,
}

impl<D> StreamDriver<D>
where
    D: Dialer,
    AstrolinkError: From<D::Error> + From<<D::Connection as Connection>::Error>,
{
    pub fn new(dialer: D, http: reqwest::Client, context: StreamContext) -> (Self, StreamHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (stop_tx, stop_rx) = watch::channel(false);
        let policy = context.policy.validated();
        let driver = Self {
            dialer,
            http,
            endpoint: context.endpoint,
            dialect: context.dialect,
            cache: context.cache,
            counter: context.counter,
            observers: context.observers,
            backoff: ExponentialBackoff::new(policy.base_delay, policy.backoff_cap),
            commands: command_rx,
            stop: stop_rx,
            cancelled: context.cancelled,
        };
        let handle = StreamHandle {
            commands: command_tx,
            stop: stop_tx,
        };
        (driver, handle)
    }

    /// Runs until stopped. Connection drops and handshake failures redial
    /// with backoff; only a stop signal or client shutdown ends the loop.
    pub async fn run(mut self) {
        debug!(endpoint = %self.endpoint, dialect = %self.dialect, "feed driver started");
        loop {
            if self.exit_requested() {
                break;
            }
            match self.connect_and_stream().await {
                Ok(PumpExit::Stop) => break,
                Ok(PumpExit::Redial) => debug!("feed reconnect requested"),
                Err(err) => error!(error = %err, "feed connection lost"),
            }
            let delay = self.backoff.next_delay();
            if !delay.is_zero() && self.backoff_or_exit(delay).await {
                break;
            }
        }
        debug!("feed driver stopped");
    }

    /// Sleeps out one backoff delay. Returns true when a stop or shutdown
    /// signal fires before the delay elapses.
    async fn backoff_or_exit(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => false,
            _ = exit_fired(&mut self.stop, &mut self.cancelled) => true,
        }
    }

    fn exit_requested(&self) -> bool {
        if *self.stop.borrow() || *self.cancelled.borrow() {
            return true;
        }
        // A dropped stop sender means the client itself is gone.
        self.stop.has_changed().is_err()
    }

    async fn connect_and_stream(&mut self) -> Result<PumpExit, AstrolinkError> {
        let ws_url = self.handshake().await?;
        let conn = self.dialer.dial(&ws_url).await?;
        debug!(id = %conn.id(), dialect = %self.dialect, "feed socket open");
        if self.dialect == Dialect::Current {
            self.send(&conn, frame::PROBE).await;
        }
        let exit = self.pump(&conn).await;
        conn.close().await;
        exit
    }

    /// Performs the HTTP handshake and returns the websocket URL to dial.
    /// A handshake that answers resets the backoff, so redials after it
    /// are instant.
    async fn handshake(&mut self) -> Result<String, AstrolinkError> {
        match self.dialect {
            Dialect::Current => {
                let url = self.endpoint.polling_url(&yeast(now_millis()));
                let body = self
                    .http
                    .get(&url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                self.backoff.reset();
                let sid = astrolink_protocol::handshake::extract_sid(&body)?;
                Ok(self.endpoint.websocket_url(&sid))
            }
            Dialect::Legacy => {
                let url = self.endpoint.legacy_polling_url(now_millis());
                let body = self
                    .http
                    .get(&url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                self.backoff.reset();
                let token = astrolink_protocol::handshake::extract_legacy_token(&body)?;
                Ok(self.endpoint.legacy_websocket_url(&token))
            }
        }
    }

    /// Reads frames until the connection drops or an exit is requested.
    /// Reads wake every [`READ_DEADLINE`] so stop signals and commands are
    /// honored even on a silent socket.
    async fn pump(&mut self, conn: &D::Connection) -> Result<PumpExit, AstrolinkError> {
        loop {
            if self.exit_requested() {
                return Ok(PumpExit::Stop);
            }
            match self.commands.try_recv() {
                Ok(StreamCommand::Reconnect) => {
                    debug!(id = %conn.id(), "dropping feed socket on request");
                    return Ok(PumpExit::Redial);
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(PumpExit::Stop),
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            let frame = match timeout(READ_DEADLINE, conn.recv()).await {
                Err(_) => continue,
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    return Err(TransportError::ConnectionClosed("feed closed by server".into()).into());
                }
                Ok(Err(err)) => return Err(err.into()),
            };
            self.observers.dispatch_raw(&frame);
            match self.dialect {
                Dialect::Current => self.on_current_frame(&frame, conn).await,
                Dialect::Legacy => self.on_legacy_frame(&frame, conn).await,
            }
        }
    }

    async fn on_current_frame(&self, raw: &str, conn: &D::Connection) {
        match CurrentFrame::parse(raw) {
            Ok(CurrentFrame::ProbeAck) => {
                self.send(conn, frame::UPGRADE).await;
                self.send(conn, &frame::current_subscribe(frame::CHAT_NAMESPACE))
                    .await;
                self.send(conn, &frame::current_subscribe(frame::AUCTIONEER_NAMESPACE))
                    .await;
            }
            Ok(CurrentFrame::AuctioneerOpen) => debug!("auctioneer namespace open"),
            Ok(CurrentFrame::ChatOpen) => {
                let authorize =
                    frame::current_authorize(self.next_counter(), &self.cache.session());
                self.send(conn, &authorize).await;
            }
            Ok(CurrentFrame::Ping) => self.send(conn, frame::PONG).await,
            Ok(CurrentFrame::ChatAuthAck { ok: true }) => debug!("chat connected"),
            Ok(CurrentFrame::ChatAuthAck { ok: false }) => error!("chat authorization refused"),
            Ok(CurrentFrame::ChatEvent(message)) => self.observers.dispatch_chat(message),
            Ok(CurrentFrame::Auctioneer(event)) => self.observers.dispatch_auctioneer(event),
            Ok(CurrentFrame::Other) => {
                warn!(frame = raw, "unknown feed frame");
                sleep(UNKNOWN_FRAME_PAUSE).await;
            }
            Err(err) => error!(error = %err, "failed to decode feed frame"),
        }
    }

    async fn on_legacy_frame(&self, raw: &str, conn: &D::Connection) {
        match LegacyFrame::parse(raw) {
            Ok(LegacyFrame::Connect) => {
                self.send(conn, &frame::legacy_join(frame::CHAT_NAMESPACE)).await;
                self.send(conn, &frame::legacy_join(frame::AUCTIONEER_NAMESPACE))
                    .await;
            }
            Ok(LegacyFrame::ChatJoined) => {
                let authorize =
                    frame::legacy_authorize(self.next_counter(), &self.cache.session());
                self.send(conn, &authorize).await;
            }
            Ok(LegacyFrame::Heartbeat) => self.send(conn, frame::LEGACY_HEARTBEAT).await,
            Ok(LegacyFrame::ChatAuthAck { ok: true }) => debug!("chat connected"),
            Ok(LegacyFrame::ChatAuthAck { ok: false }) => error!("chat authorization refused"),
            Ok(LegacyFrame::ChatBatch(payload)) => {
                for message in payload.args {
                    self.observers.dispatch_chat(message);
                }
            }
            Ok(LegacyFrame::Auctioneer(event)) => self.observers.dispatch_auctioneer(event),
            Ok(LegacyFrame::Other) => {
                warn!(frame = raw, "unknown feed frame");
                sleep(UNKNOWN_FRAME_PAUSE).await;
            }
            Err(err) => error!(error = %err, "failed to decode feed frame"),
        }
    }

    /// Hands out the current counter value and advances it. Authorize
    /// frames carry the pre-increment value.
    fn next_counter(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Send failures are logged, not fatal: a dead socket surfaces on the
    /// next read and triggers a redial there.
    async fn send(&self, conn: &D::Connection, frame: &str) {
        if let Err(err) = conn.send(frame).await {
            error!(error = %err, "failed to send feed frame");
        }
    }
}

async fn exit_fired(stop: &mut watch::Receiver<bool>, cancelled: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = stop.wait_for(|flag| *flag) => {}
        _ = cancelled.wait_for(|flag| *flag) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astrolink_protocol::AuctionPlayer;
    use astrolink_transport::ConnectionId;
    use std::collections::VecDeque;

    // =========================================================================
    // Backoff
    // =========================================================================

    #[test]
    fn test_backoff_first_delay_is_instant_then_doubles() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_caps_at_maximum() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut last = Duration::ZERO;
        for _ in 0..12 {
            last = backoff.next_delay();
        }
        assert_eq!(last, Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_reset_makes_next_delay_instant() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    // =========================================================================
    // Observers
    // =========================================================================

    fn chat_message(id: i64, text: &str) -> ChatMessage {
        ChatMessage {
            sender_id: 7,
            sender_name: "Pilot".into(),
            association_id: 0,
            text: text.into(),
            id,
            date: 1_621_500_000,
        }
    }

    /// Drains `count` items from a channel, failing if they never arrive.
    async fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>, count: usize) -> Vec<T> {
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let item = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("observer ran")
                .expect("channel open");
            items.push(item);
        }
        items
    }

    /// Asserts nothing further arrives on a channel.
    async fn assert_drained<T>(rx: &mut mpsc::UnboundedReceiver<T>) {
        assert!(
            timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
            "unexpected extra observer invocation"
        );
    }

    #[tokio::test]
    async fn test_observers_chat_fans_out_to_all() {
        let observers = StreamObservers::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        for tx in [tx_a, tx_b] {
            observers.on_chat_message(move |msg| {
                let _ = tx.send(msg.id);
            });
        }

        observers.dispatch_chat(chat_message(11, "hello"));
        observers.dispatch_chat(chat_message(12, "again"));

        // Dispatch tasks are spawned, so only the set of ids is guaranteed.
        let mut ids_a = drain(&mut rx_a, 2).await;
        let mut ids_b = drain(&mut rx_b, 2).await;
        ids_a.sort_unstable();
        ids_b.sort_unstable();
        assert_eq!(ids_a, vec![11, 12]);
        assert_eq!(ids_b, vec![11, 12]);
    }

    #[tokio::test]
    async fn test_observers_auctioneer_receives_event() {
        let observers = StreamObservers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        observers.on_auctioneer_event(move |event| {
            let _ = tx.send(event);
        });

        observers.dispatch_auctioneer(AuctioneerEvent::TimeRemaining { approx: 1800 });

        assert_eq!(
            drain(&mut rx, 1).await,
            vec![AuctioneerEvent::TimeRemaining { approx: 1800 }]
        );
        assert_drained(&mut rx).await;
    }

    #[tokio::test]
    async fn test_observers_raw_sees_frame_and_removal_stops_it() {
        let observers = StreamObservers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        observers.on_raw_frame("probe", move |frame| {
            let _ = tx.send(frame);
        });

        observers.dispatch_raw("2::");
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("raw observer ran")
            .expect("frame delivered");
        assert_eq!(frame, "2::");

        observers.remove_raw_frame("probe");
        observers.dispatch_raw("2::");
        assert!(
            timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err(),
            "removed observer must not fire"
        );
    }

    #[test]
    fn test_observers_raw_same_id_replaces() {
        let observers = StreamObservers::new();
        observers.on_raw_frame("x", |_| {});
        observers.on_raw_frame("x", |_| {});
        assert_eq!(
            observers
                .raw
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            1
        );
    }

    // =========================================================================
    // Pump
    // =========================================================================

    /// What a scripted connection does once its frames run out.
    #[derive(Clone, Copy)]
    enum Drained {
        /// Report the peer closing.
        Close,
        /// Sit silent so only the read deadline wakes the driver.
        Hang,
    }

    #[derive(Clone)]
    struct ScriptedConnection {
        inner: Arc<ScriptedInner>,
    }

    struct ScriptedInner {
        frames: Mutex<VecDeque<String>>,
        sent: Mutex<Vec<String>>,
        drained: Drained,
    }

    impl ScriptedConnection {
        fn new(frames: &[&str], drained: Drained) -> Self {
            Self {
                inner: Arc::new(ScriptedInner {
                    frames: Mutex::new(frames.iter().map(|f| f.to_string()).collect()),
                    sent: Mutex::new(Vec::new()),
                    drained,
                }),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.inner.sent.lock().unwrap().clone()
        }
    }

    impl Connection for ScriptedConnection {
        type Error = TransportError;

        async fn send(&self, frame: &str) -> Result<(), TransportError> {
            self.inner.sent.lock().unwrap().push(frame.to_string());
            Ok(())
        }

        async fn recv(&self) -> Result<Option<String>, TransportError> {
            let next = self.inner.frames.lock().unwrap().pop_front();
            match next {
                Some(frame) => Ok(Some(frame)),
                None => match self.inner.drained {
                    Drained::Close => Ok(None),
                    Drained::Hang => std::future::pending().await,
                },
            }
        }

        async fn close(&self) {}

        fn id(&self) -> ConnectionId {
            ConnectionId(1)
        }
    }

    struct ScriptedDialer {
        conn: ScriptedConnection,
    }

    impl Dialer for ScriptedDialer {
        type Connection = ScriptedConnection;
        type Error = TransportError;

        async fn dial(&self, _url: &str) -> Result<ScriptedConnection, TransportError> {
            Ok(self.conn.clone())
        }
    }

    struct Harness {
        driver: StreamDriver<ScriptedDialer>,
        handle: StreamHandle,
        _cancel: watch::Sender<bool>,
    }

    fn harness(dialect: Dialect, conn: ScriptedConnection) -> Harness {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cache = Arc::new(SessionCache::new());
        cache.apply_page(astrolink_session::PageUpdate {
            session: Some("s3cret".into()),
            ..Default::default()
        });
        let (driver, handle) = StreamDriver::new(
            ScriptedDialer { conn },
            reqwest::Client::new(),
            StreamContext {
                endpoint: StreamEndpoint::new("node.test", 19603),
                dialect,
                policy: RetryPolicy::default(),
                cache,
                counter: Arc::new(AtomicI64::new(1)),
                observers: Arc::new(StreamObservers::new()),
                cancelled: cancel_rx,
            },
        );
        Harness {
            driver,
            handle,
            _cancel: cancel_tx,
        }
    }

    #[tokio::test]
    async fn test_pump_legacy_joins_then_authorizes_once() {
        let conn = ScriptedConnection::new(&["1::", "1::/chat", "2::"], Drained::Close);
        let mut h = harness(Dialect::Legacy, conn.clone());

        let outcome = h.driver.pump(&conn).await;

        assert!(outcome.is_err(), "peer close must surface as an error");
        assert_eq!(
            conn.sent(),
            vec![
                "1::/chat".to_string(),
                "1::/auctioneer".to_string(),
                r#"5:1+:/chat:{"name":"authorize","args":["s3cret"]}"#.to_string(),
                "2::".to_string(),
            ]
        );
        assert_eq!(h.driver.counter.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_pump_current_subscribes_and_authorizes_after_probe() {
        let conn = ScriptedConnection::new(
            &[
                "3probe",
                r#"40/auctioneer,{"sid":"a1"}"#,
                r#"40/chat,{"sid":"c1"}"#,
                "2",
                "43/chat,1[true]",
            ],
            Drained::Close,
        );
        let mut h = harness(Dialect::Current, conn.clone());

        let outcome = h.driver.pump(&conn).await;

        assert!(outcome.is_err());
        assert_eq!(
            conn.sent(),
            vec![
                "5".to_string(),
                "40/chat,".to_string(),
                "40/auctioneer,".to_string(),
                r#"42/chat,1["authorize","s3cret"]"#.to_string(),
                "3".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_pump_current_chat_event_reaches_observer() {
        let conn = ScriptedConnection::new(
            &[r#"42/chat,["chat",{"senderId":4,"senderName":"Ace","associationId":0,"text":"o7","id":99,"date":1621500000}]"#],
            Drained::Close,
        );
        let mut h = harness(Dialect::Current, conn.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.driver.observers.on_chat_message(move |msg| {
            let _ = tx.send(msg);
        });

        let _ = h.driver.pump(&conn).await;

        let seen = drain(&mut rx, 1).await;
        assert_eq!(seen[0].sender_name, "Ace");
        assert_eq!(seen[0].id, 99);
        assert_drained(&mut rx).await;
    }

    #[tokio::test]
    async fn test_pump_legacy_batch_fans_out_each_message() {
        let payload = r#"5::/chat:{"name":"chat","args":[
            {"senderId":1,"senderName":"A","associationId":0,"text":"x","id":1,"date":0},
            {"senderId":2,"senderName":"B","associationId":0,"text":"y","id":2,"date":0}
        ]}"#
        .replace('\n', "");
        let conn = ScriptedConnection::new(&[payload.as_str()], Drained::Close);
        let mut h = harness(Dialect::Legacy, conn.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.driver.observers.on_chat_message(move |msg| {
            let _ = tx.send(msg.id);
        });

        let _ = h.driver.pump(&conn).await;

        let mut ids = drain(&mut rx, 2).await;
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_drained(&mut rx).await;
    }

    #[tokio::test]
    async fn test_pump_reconnect_command_requests_redial() {
        let conn = ScriptedConnection::new(&[], Drained::Hang);
        let mut h = harness(Dialect::Legacy, conn.clone());
        assert!(h.handle.reconnect());

        let outcome = h.driver.pump(&conn).await;

        assert!(matches!(outcome, Ok(PumpExit::Redial)));
        assert!(conn.sent().is_empty());
    }

    #[tokio::test]
    async fn test_pump_stop_wins_over_pending_frames() {
        let conn = ScriptedConnection::new(&["1::"], Drained::Hang);
        let mut h = harness(Dialect::Legacy, conn.clone());
        h.handle.stop();

        let outcome = h.driver.pump(&conn).await;

        assert!(matches!(outcome, Ok(PumpExit::Stop)));
        assert!(conn.sent().is_empty(), "no frame read after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_idle_socket_survives_read_deadlines() {
        let conn = ScriptedConnection::new(&[], Drained::Hang);
        let h = harness(Dialect::Legacy, conn.clone());
        let mut driver = h.driver;
        let stopper = h.handle;

        let pump = tokio::spawn(async move { driver.pump(&conn).await });
        // Let several read deadlines elapse before asking for shutdown.
        sleep(Duration::from_secs(5)).await;
        stopper.stop();

        let outcome = timeout(Duration::from_secs(5), pump)
            .await
            .expect("pump exits after stop")
            .expect("pump task not cancelled");
        assert!(matches!(outcome, Ok(PumpExit::Stop)));
    }

    #[tokio::test]
    async fn test_pump_auctioneer_event_reaches_observer_decoded() {
        let frame = r#"5::/auctioneer:{"name":"timeLeft","args":["<span style='color:#9c0;'><b>approx. 30m</b></span> remaining"]}"#;
        let conn = ScriptedConnection::new(&[frame], Drained::Close);
        let mut h = harness(Dialect::Legacy, conn.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.driver.observers.on_auctioneer_event(move |event| {
            let _ = tx.send(event);
        });

        let _ = h.driver.pump(&conn).await;

        assert_eq!(
            drain(&mut rx, 1).await,
            vec![AuctioneerEvent::TimeRemaining { approx: 1800 }]
        );
        assert_drained(&mut rx).await;
    }

    #[tokio::test]
    async fn test_pump_new_bid_dispatches_once_with_decoded_fields() {
        let frame = r#"42/auctioneer,["new bid",{"auctionId":"42894","sum":2000,"price":3000,"bids":4,"player":{"id":5,"name":"Bidder","link":"https://s1.example/profile/5"}}]"#;
        let conn = ScriptedConnection::new(&[frame], Drained::Close);
        let mut h = harness(Dialect::Current, conn.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.driver.observers.on_auctioneer_event(move |event| {
            let _ = tx.send(event);
        });

        let _ = h.driver.pump(&conn).await;

        assert_eq!(
            drain(&mut rx, 1).await,
            vec![AuctioneerEvent::NewBid {
                auction_id: 42894,
                sum: 2000,
                price: 3000,
                bids: 4,
                player: AuctionPlayer {
                    id: 5,
                    name: "Bidder".into(),
                    link: "https://s1.example/profile/5".into(),
                },
            }]
        );
        assert_drained(&mut rx).await;
    }

    // =========================================================================
    // Redial backoff
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_backoff_or_exit_stop_interrupts_long_delay() {
        let conn = ScriptedConnection::new(&[], Drained::Hang);
        let h = harness(Dialect::Legacy, conn);
        let mut driver = h.driver;
        let stopper = h.handle;

        let waiter = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let interrupted = driver.backoff_or_exit(Duration::from_secs(60)).await;
            (interrupted, started.elapsed())
        });
        sleep(Duration::from_secs(2)).await;
        stopper.stop();

        let (interrupted, waited) = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stop interrupts the delay")
            .expect("waiter task not cancelled");
        assert!(interrupted, "stop must report an exit, not a timeout");
        assert!(waited < Duration::from_secs(60), "stop must cut the delay short");
    }
}
