//! One-slot "session expired" channel from the request pipeline to the auth
//! state machine.
//!
//! Events coalesce: a listener that falls behind observes a single pending
//! event carrying the latest sequence number, never a backlog.

use std::sync::Arc;

use tokio::sync::watch;

/// A published unauthorized event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnauthorizedEvent {
    /// Number of events published so far, this one included
    pub seq: u64,
    /// Credential epoch of the session that could not be recovered
    pub epoch: u64,
}

#[derive(Clone)]
pub struct UnauthorizedNotifier {
    tx: Arc<watch::Sender<UnauthorizedEvent>>,
}

impl UnauthorizedNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(UnauthorizedEvent::default());
        Self { tx: Arc::new(tx) }
    }

    /// Publish that the session identified by `epoch` has expired.
    pub fn notify(&self, epoch: u64) {
        self.tx.send_modify(|event| {
            event.seq += 1;
            event.epoch = epoch;
        });
    }

    /// Number of events published so far.
    pub fn count(&self) -> u64 {
        self.tx.borrow().seq
    }

    /// Listen for events published after this call.
    pub fn subscribe(&self) -> UnauthorizedListener {
        UnauthorizedListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for UnauthorizedNotifier {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UnauthorizedListener {
    rx: watch::Receiver<UnauthorizedEvent>,
}

impl UnauthorizedListener {
    /// Wait for the next event. Returns `None` once every notifier is dropped.
    pub async fn recv(&mut self) -> Option<UnauthorizedEvent> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
