//! Session state machine gating the rest of the application.
//!
//! ```text
//! Unknown ──bootstrap──▶ Authenticated | Unauthenticated
//! Unauthenticated ──sign_in──▶ Loading ──▶ Authenticated | Unauthenticated(error)
//! Authenticated ──sign_out / unauthorized──▶ Unauthenticated
//! ```
//!
//! Readers get snapshots ([`AuthStateMachine::current_state`]), callbacks
//! ([`AuthStateMachine::subscribe`]) or a tokio watch receiver
//! ([`AuthStateMachine::watch`]).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::Session;

use super::{CredentialStore, SessionRepository, UnauthorizedListener};

/// Shown for any failed sign-in. Server errors are logged, never displayed.
pub const SIGN_IN_FAILED_MESSAGE: &str = "Unable to sign in. Check your credentials.";

/// Shown when the sign-in form is submitted incomplete.
pub const MISSING_CREDENTIALS_MESSAGE: &str = "Enter your username and password.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum AuthState {
    Unknown,
    Loading,
    Authenticated(Session),
    Unauthenticated(Option<String>),
}

impl AuthState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            AuthState::Unauthenticated(error) => error.as_deref(),
            _ => None,
        }
    }
}

/// Handle returned by [`AuthStateMachine::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&AuthState) + Send + Sync>;

pub struct AuthStateMachine {
    sessions: Arc<SessionRepository>,
    credentials: Arc<CredentialStore>,
    state: watch::Sender<AuthState>,
    // Credential epoch of the session shown as Authenticated
    session_epoch: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    // Last state handed to subscribers; held while callbacks run
    delivered: Mutex<AuthState>,
    delivery_pending: AtomicBool,
    bootstrapped: AtomicBool,
}

impl AuthStateMachine {
    pub fn new(sessions: Arc<SessionRepository>, credentials: Arc<CredentialStore>) -> Self {
        let (state, _rx) = watch::channel(AuthState::Unknown);
        Self {
            sessions,
            credentials,
            state,
            session_epoch: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            delivered: Mutex::new(AuthState::Unknown),
            delivery_pending: AtomicBool::new(false),
            bootstrapped: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn current_state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Register a callback invoked after each state change
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&AuthState) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    /// Replace the state; subscribers are only notified on an actual change.
    fn transition(&self, next: AuthState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            debug!(state = state_name(&next), "Auth state changed");
            self.deliver();
        }
    }

    fn authenticated(&self, session: Session) {
        self.session_epoch
            .store(self.credentials.epoch(), Ordering::SeqCst);
        self.transition(AuthState::Authenticated(session));
    }

    /// Hand the current state to subscribers, one delivery at a time.
    ///
    /// Each pass delivers whatever is current when it runs, so the last
    /// callback a subscriber sees always matches `current_state()`. A
    /// transition made while another thread (or a callback on this thread)
    /// is delivering is picked up by that delivery loop.
    fn deliver(&self) {
        self.delivery_pending.store(true, Ordering::SeqCst);
        loop {
            let mut last = match self.delivered.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            while self.delivery_pending.swap(false, Ordering::SeqCst) {
                let snapshot = self.current_state();
                if *last != snapshot {
                    *last = snapshot.clone();
                    self.notify(&snapshot);
                }
            }
            drop(last);
            if !self.delivery_pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn notify(&self, state: &AuthState) {
        // Call outside the lock so a callback may (un)subscribe
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in subscribers {
            callback(state);
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Restore the session at startup. Runs once; later calls return the current state.
    pub async fn bootstrap(&self) -> AuthState {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            debug!("Bootstrap already ran");
            return self.current_state();
        }

        let credentials = match self.credentials.load() {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(error = %e, "Failed to load stored credentials");
                Default::default()
            }
        };

        if credentials.access.is_none() {
            info!("No stored session");
            self.transition(AuthState::Unauthenticated(None));
            return self.current_state();
        }

        match self.sessions.fetch_session().await {
            Ok(session) => {
                info!(user_id = session.user.id, "Session restored");
                self.authenticated(session);
            }
            Err(fetch_err) => {
                debug!(error = %fetch_err, "Stored access token rejected, trying refresh");
                match self.sessions.refresh().await {
                    Ok(session) => {
                        info!(user_id = session.user.id, "Session restored after refresh");
                        self.authenticated(session);
                    }
                    Err(refresh_err) => {
                        warn!(error = %refresh_err, "Could not restore session");
                        self.sessions.sign_out();
                        self.transition(AuthState::Unauthenticated(None));
                    }
                }
            }
        }
        self.current_state()
    }

    pub async fn sign_in(&self, username: &str, password: &str) -> AuthState {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            self.transition(AuthState::Unauthenticated(Some(
                MISSING_CREDENTIALS_MESSAGE.to_string(),
            )));
            return self.current_state();
        }

        self.transition(AuthState::Loading);
        match self.sessions.authenticate(username, password).await {
            Ok(session) => {
                info!(user_id = session.user.id, "Sign-in successful");
                self.authenticated(session);
            }
            Err(e) => {
                error!(error = %e, "Sign-in failed");
                self.transition(AuthState::Unauthenticated(Some(
                    SIGN_IN_FAILED_MESSAGE.to_string(),
                )));
            }
        }
        self.current_state()
    }

    pub fn sign_out(&self) {
        self.sessions.sign_out();
        self.transition(AuthState::Unauthenticated(None));
    }

    /// The pipeline could not recover the session at `epoch` from a 401.
    ///
    /// Signs out if that session is the one currently shown as authenticated.
    /// Events for a sign-in that never completed, or for a session already
    /// signed out or replaced, are ignored. Returns whether it signed out.
    pub fn handle_unauthorized(&self, epoch: u64) -> bool {
        if !self.current_state().is_authenticated()
            || self.session_epoch.load(Ordering::SeqCst) != epoch
        {
            debug!(epoch, "Ignoring unauthorized event for an inactive session");
            return false;
        }
        info!("Session expired, signing out");
        self.sign_out();
        true
    }

    /// Route unauthorized events from `listener` into [`Self::handle_unauthorized`].
    ///
    /// The task holds only a weak reference and ends when either side is dropped.
    pub fn spawn_unauthorized_listener(
        self: &Arc<Self>,
        mut listener: UnauthorizedListener,
    ) -> JoinHandle<()> {
        let machine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = listener.recv().await {
                let Some(machine) = machine.upgrade() else {
                    break;
                };
                machine.handle_unauthorized(event.epoch);
            }
            debug!("Unauthorized listener stopped");
        })
    }
}

fn state_name(state: &AuthState) -> &'static str {
    match state {
        AuthState::Unknown => "unknown",
        AuthState::Loading => "loading",
        AuthState::Authenticated(_) => "authenticated",
        AuthState::Unauthenticated(_) => "unauthenticated",
    }
}
