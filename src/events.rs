use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::peer::state::ConnectionState;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Transient toast shown by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub text: String,
    pub severity: Severity,
    pub auto_dismiss_after_ms: Option<u64>,
}

impl Notification {
    pub fn new(severity: Severity, text: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            text: text.into(),
            severity,
            auto_dismiss_after_ms: ttl.map(|d| d.as_millis() as u64),
        }
    }

    pub fn error(text: impl Into<String>, ttl: Duration) -> Self {
        Self::new(Severity::Error, text, Some(ttl))
    }

    pub fn warning(text: impl Into<String>, ttl: Duration) -> Self {
        Self::new(Severity::Warning, text, Some(ttl))
    }

    pub fn success(text: impl Into<String>, ttl: Duration) -> Self {
        Self::new(Severity::Success, text, Some(ttl))
    }

    /// Sticky until the UI dismisses it.
    pub fn info(text: impl Into<String>) -> Self {
        Self::new(Severity::Info, text, None)
    }
}

/// Where the UI should go next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Home,
    Dashboard,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    CallStarted {
        started_at: DateTime<Utc>,
    },
    MuteChanged {
        muted: bool,
    },
    RemoteAudio {
        stream_id: Uuid,
    },
    PlaybackStarted {
        stream_id: Uuid,
    },
    AudioUnlockRequired {
        stream_id: Uuid,
    },
    Notify(Notification),
    RegistrationPrompt,
    UpgradePrompt,
    Navigate {
        to: Destination,
    },
}

/// Fan-out of call events to any number of UI listeners.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        debug!(?event, listeners = self.tx.receiver_count(), "emit");
        // no listeners is fine, the UI may not be attached yet
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
