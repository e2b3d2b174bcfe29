//! The lifecycle state machine.
//!
//! Four independent boolean flags describe the bot at any instant:
//! `enabled` (operator intent), `logged_in` (a session exists),
//! `connected` (the session answered recently), and `locked` (a task holds
//! the exclusive execution slot). Disabling fires a cancellation signal
//! that every blocking wait in the stack observes; enabling installs a
//! fresh signal so old waiters stay cancelled.

use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

type StateObserver = Arc<dyn Fn(bool, &str) + Send + Sync>;

/// Shared lifecycle flags plus the cancellation signal.
///
/// All accessors are non-blocking; none of the operations here can fail.
pub struct Lifecycle {
    enabled: AtomicBool,
    logged_in: AtomicBool,
    connected: AtomicBool,
    locked: AtomicBool,
    actor: Mutex<String>,
    observers: Mutex<Vec<StateObserver>>,
    cancel: Mutex<watch::Sender<bool>>,
}

impl Lifecycle {
    /// A fresh, disabled lifecycle. Call [`enable`](Self::enable) to start.
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            enabled: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            actor: Mutex::new(String::new()),
            observers: Mutex::new(Vec::new()),
            cancel: Mutex::new(cancel),
        }
    }

    /// Marks the bot enabled and installs a fresh cancellation signal.
    /// Waiters subscribed before the previous disable stay cancelled.
    pub fn enable(&self) {
        let (cancel, _) = watch::channel(false);
        *self.lock_mutex(&self.cancel) = cancel;
        self.enabled.store(true, Ordering::SeqCst);
        debug!("lifecycle enabled");
        self.notify(false, "enable");
    }

    /// Marks the bot disabled and cancels every subscribed waiter.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.lock_mutex(&self.cancel).send_replace(true);
        debug!("lifecycle disabled");
        self.notify(false, "disable");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }

    /// Clears the logged-in flag; `true` when this call did the clearing.
    /// Lets exactly one of several racing logouts run the teardown.
    pub fn clear_logged_in(&self) -> bool {
        self.logged_in
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Records that `actor` took the exclusive slot. Notifies observers
    /// only on an actual transition, so re-entrant calls stay silent.
    pub fn lock(&self, actor: &str) -> bool {
        let transitioned = self
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if transitioned {
            *self.lock_mutex(&self.actor) = actor.to_string();
            self.notify(true, actor);
        }
        transitioned
    }

    /// Records that `actor` released the exclusive slot.
    pub fn unlock(&self, actor: &str) -> bool {
        let transitioned = self
            .locked
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if transitioned {
            *self.lock_mutex(&self.actor) = actor.to_string();
            self.notify(false, actor);
        }
        transitioned
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Current lock flag and the label of whoever last moved it.
    pub fn state(&self) -> (bool, String) {
        (self.is_locked(), self.lock_mutex(&self.actor).clone())
    }

    /// Registers an observer invoked synchronously on every state change
    /// with `(locked, actor)`.
    pub fn on_state_change(&self, observer: impl Fn(bool, &str) + Send + Sync + 'static) {
        self.lock_mutex(&self.observers).push(Arc::new(observer));
    }

    /// A receiver that flips to `true` when the current enable-generation
    /// is cancelled. Subscribing after a disable yields an
    /// already-cancelled receiver.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.lock_mutex(&self.cancel).subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled().borrow()
    }

    fn notify(&self, locked: bool, actor: &str) {
        let observers = self.lock_mutex(&self.observers).clone();
        for observer in observers {
            observer(locked, actor);
        }
    }

    fn lock_mutex<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("enabled", &self.is_enabled())
            .field("logged_in", &self.is_logged_in())
            .field("connected", &self.is_connected())
            .field("locked", &self.is_locked())
            .finish()
    }
}
