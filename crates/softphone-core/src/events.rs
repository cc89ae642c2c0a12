//! Event system for the softphone core
//!
//! The core never renders anything and never depends on how its consumers
//! react. It publishes [`CoreEvent`]s on a broadcast channel; the UI layer,
//! a status-light bridge and a tone player each subscribe independently.
//!
//! ```rust
//! use softphone_core::events::{CoreEvent, EventEmitter, Notification, Severity};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let emitter = EventEmitter::new(16);
//! let mut events = emitter.subscribe_simple();
//!
//! emitter.emit(CoreEvent::Notification(Notification::new(
//!     Severity::Info,
//!     "Reconnected",
//!     "Connection restored.",
//! )));
//!
//! match events.next().await {
//!     Some(CoreEvent::Notification(n)) => assert_eq!(n.severity, Severity::Info),
//!     other => panic!("unexpected event: {:?}", other),
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::reconnect::ReconnectState;
use crate::registration::RegistrationState;
use crate::session::{CallDirection, SessionState};
use crate::transport::TransportEvent;

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Warning,
    Info,
    Error,
}

/// A message for the UI layer to display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(severity: Severity, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            body: body.into(),
        }
    }
}

/// A call session moved between states
///
/// `previous_state` is `None` for the event announcing a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStateChange {
    pub session_id: String,
    pub previous_state: Option<SessionState>,
    pub new_state: SessionState,
    pub direction: CallDirection,
}

/// Events published by the softphone core
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A call session changed state
    SessionStateChanged(SessionStateChange),

    /// Registration state changed
    RegistrationStateChanged {
        previous: RegistrationState,
        current: RegistrationState,
        /// Set when the user asked for the change
        intentional: bool,
    },

    /// Transport lifecycle event
    Transport(TransportEvent),

    /// Startup reconnect progressed
    ReconnectStateChanged { state: ReconnectState },

    /// Message for the user
    Notification(Notification),
}

impl CoreEvent {
    /// Session id for session-scoped events
    pub fn session_id(&self) -> Option<&str> {
        match self {
            CoreEvent::SessionStateChanged(change) => Some(change.session_id.as_str()),
            _ => None,
        }
    }

    pub fn as_notification(&self) -> Option<&Notification> {
        match self {
            CoreEvent::Notification(notification) => Some(notification),
            _ => None,
        }
    }
}

/// Event stream type
pub type EventStream = BroadcastStream<CoreEvent>;

/// Simple event iterator that doesn't require StreamExt
pub struct EventIterator {
    stream: EventStream,
}

impl EventIterator {
    pub fn new(stream: EventStream) -> Self {
        Self { stream }
    }

    /// Next event, skipping over notices that this subscriber lagged behind
    pub async fn next(&mut self) -> Option<CoreEvent> {
        use tokio_stream::StreamExt;
        loop {
            match self.stream.next().await {
                Some(Ok(event)) => return Some(event),
                Some(Err(lagged)) => {
                    tracing::warn!(error = %lagged, "event subscriber lagged");
                }
                None => return None,
            }
        }
    }
}

/// Broadcast publisher shared by every component of one core instance
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: CoreEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event dropped, no subscribers");
        }
    }

    pub fn notify(&self, notification: Notification) {
        tracing::info!(
            severity = ?notification.severity,
            title = %notification.title,
            "notification"
        );
        self.emit(CoreEvent::Notification(notification));
    }

    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn subscribe_simple(&self) -> EventIterator {
        EventIterator::new(self.subscribe())
    }

    /// Raw receiver for consumers that poll with `try_recv`
    pub fn receiver(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(100)
    }
}
