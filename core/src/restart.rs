//! Single-slot restart signal between a broker session and its owner
//!
//! ```text
//! Session ──(lost)──► SessionLost::fire ──► RestartSignal ──► owner loop
//!                      (once per session)    (one pending)     close + connect
//! ```
//!
//! The owner creates one [`RestartSignal`] per pipeline and hands a fresh
//! [`SessionLost`] listener to every session it opens. A listener fires at
//! most once, so a burst of loss notifications from one session produces a
//! single rebuild. The signal itself holds at most one pending restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::error;

/// Owner side of the restart signal
#[derive(Debug, Default)]
pub struct RestartSignal {
    notify: Arc<Notify>,
    fired: Arc<AtomicU64>,
}

impl RestartSignal {
    /// Create an idle signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a listener for one session
    pub fn listener(&self, name: impl Into<String>) -> SessionLost {
        SessionLost {
            name: Arc::from(name.into()),
            fired: Arc::new(AtomicBool::new(false)),
            notify: Arc::clone(&self.notify),
            total: Arc::clone(&self.fired),
        }
    }

    /// Wait until a session reports loss
    ///
    /// Consumes the pending restart, if any.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Number of loss events that reached this signal
    pub fn fired_count(&self) -> u64 {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Session side of the restart signal
///
/// Cheap to clone; clones share the fired flag.
#[derive(Debug, Clone)]
pub struct SessionLost {
    name: Arc<str>,
    fired: Arc<AtomicBool>,
    notify: Arc<Notify>,
    total: Arc<AtomicU64>,
}

impl SessionLost {
    /// Report that the session is gone
    ///
    /// Returns `true` when this call raised the restart, `false` when the
    /// session had already reported its loss.
    pub fn fire(&self, reason: &str) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        error!(
            connection = %self.name,
            reason = reason,
            "Stream connection disconnected, initiating reconnection"
        );
        self.total.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        true
    }

    /// Whether this listener has fired
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
