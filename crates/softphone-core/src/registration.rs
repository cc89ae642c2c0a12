//! Registration state machine
//!
//! [`RegistrationController`] owns [`RegistrationState`] and is the only
//! place it changes. Transitions are computed by the pure function
//! [`next_state`]; [`RegistrationController`] applies them one at a time
//! under its transition lock, so a transport drop and a registration
//! response can never interleave.
//!
//! ```text
//!            register()           success
//! Unregistered ──────► Registering ──────► Registered
//!      ▲  ▲                │                   │
//!      │  │   timeout/     ▼                   │
//!      │  └──────────── Failed                 │
//!      │   transport lost / unregister()       │
//!      └───────────────────────────────────────┘
//! ```
//!
//! Entering `Unregistered`, for whatever reason, runs the session
//! termination sweep. The only exception is the fast path: already
//! `Unregistered` with no sessions left.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{RegistrationErrorKind, SoftphoneError, SoftphoneResult};
use crate::events::{CoreEvent, EventEmitter};
use crate::recovery::with_timeout;
use crate::session::SessionManager;
use crate::store::{now_epoch_ms, ConnectionStateStore, PersistedConnectionState};
use crate::transport::{TransportEvent, TransportManager};

/// Registration state of this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Failed,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegistrationState::Unregistered => "Unregistered",
            RegistrationState::Registering => "Registering",
            RegistrationState::Registered => "Registered",
            RegistrationState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Inputs of the registration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationEvent {
    RegisterRequested,
    RegisterSucceeded,
    RegisterFailed,
    TransportLost,
    UnregisterRequested,
}

/// Target state for `event` in `current`, or `None` if the event does not apply
///
/// Late registration responses (after the transport dropped or the user
/// unregistered) do not apply and are ignored.
pub fn next_state(current: RegistrationState, event: RegistrationEvent) -> Option<RegistrationState> {
    use RegistrationEvent::*;
    use RegistrationState::*;
    match (current, event) {
        (Unregistered | Failed, RegisterRequested) => Some(Registering),
        (Registering, RegisterSucceeded) => Some(Registered),
        (Registering, RegisterFailed) => Some(Failed),
        (_, TransportLost) | (_, UnregisterRequested) => Some(Unregistered),
        _ => None,
    }
}

/// Registration operations of the protocol engine
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Register this device with the server behind the open transport
    async fn register(&self, config: &ConnectionConfig) -> SoftphoneResult<()>;

    /// Withdraw the registration
    async fn unregister(&self) -> SoftphoneResult<()>;
}

/// Owner of the registration state machine
pub struct RegistrationController {
    registrar: Arc<dyn Registrar>,
    transport: Arc<TransportManager>,
    sessions: Arc<SessionManager>,
    store: Arc<dyn ConnectionStateStore>,
    events: EventEmitter,
    register_timeout: Duration,
    transition: Mutex<RegistrationState>,
    current: RwLock<RegistrationState>,
    last_error: RwLock<Option<SoftphoneError>>,
}

impl RegistrationController {
    pub fn new(
        registrar: Arc<dyn Registrar>,
        transport: Arc<TransportManager>,
        sessions: Arc<SessionManager>,
        store: Arc<dyn ConnectionStateStore>,
        events: EventEmitter,
        register_timeout: Duration,
    ) -> Self {
        Self {
            registrar,
            transport,
            sessions,
            store,
            events,
            register_timeout,
            transition: Mutex::new(RegistrationState::Unregistered),
            current: RwLock::new(RegistrationState::Unregistered),
            last_error: RwLock::new(None),
        }
    }

    /// Current registration state
    pub fn state(&self) -> RegistrationState {
        *self.current.read()
    }

    /// Error of the most recent failed registration attempt
    pub fn last_error(&self) -> Option<SoftphoneError> {
        self.last_error.read().clone()
    }

    /// Register over the open transport
    ///
    /// No-op when already registered. On success the connection record is
    /// persisted for reload recovery, unless the user asked to disconnect
    /// while the request was in flight. The success transition and the write
    /// happen under the transition lock, so an intentional unregister always
    /// clears after any write it races with.
    pub async fn register(&self) -> SoftphoneResult<()> {
        if self.transport.is_connected() && self.transport.disconnect_requested() {
            return Err(SoftphoneError::cancelled("register"));
        }
        let config = self.transport.current_config().ok_or_else(|| {
            SoftphoneError::registration(RegistrationErrorKind::NotConnected, "transport is not open")
        })?;

        match self.apply(RegistrationEvent::RegisterRequested, "register requested").await {
            Some(RegistrationState::Registering) => {}
            _ if self.state() == RegistrationState::Registered => return Ok(()),
            _ => {
                return Err(SoftphoneError::registration(
                    RegistrationErrorKind::InProgress,
                    "registration already in progress",
                ))
            }
        }

        let result = with_timeout("register", self.register_timeout, self.registrar.register(&config))
            .await
            .map_err(|e| match e {
                SoftphoneError::OperationTimeout { duration_ms, .. } => SoftphoneError::registration(
                    RegistrationErrorKind::Timeout,
                    format!("no response within {}ms", duration_ms),
                ),
                other => other,
            });

        match result {
            Ok(()) => {
                let mut state = self.transition.lock().await;
                if self.transport.disconnect_requested() {
                    info!("disconnect requested during registration, not registering");
                    self.transition_locked(&mut state, RegistrationEvent::RegisterFailed, "cancelled")
                        .await;
                    return Err(SoftphoneError::cancelled("register"));
                }
                match self
                    .transition_locked(&mut state, RegistrationEvent::RegisterSucceeded, "registered")
                    .await
                {
                    Some(RegistrationState::Registered) => {
                        *self.last_error.write() = None;
                        self.persist(config).await;
                        Ok(())
                    }
                    _ => Err(SoftphoneError::registration(
                        RegistrationErrorKind::NotConnected,
                        "transport lost during registration",
                    )),
                }
            }
            Err(e) => {
                warn!(error = %e, category = e.category(), "registration failed");
                *self.last_error.write() = Some(e.clone());
                self.apply(RegistrationEvent::RegisterFailed, "registration failed").await;
                Err(e)
            }
        }
    }

    /// Intentionally withdraw the registration from any state
    ///
    /// Always clears the persisted connection record so the next startup does
    /// not reconnect on its own.
    pub async fn unregister(&self, reason: &str) -> SoftphoneResult<()> {
        if self.state() == RegistrationState::Registered {
            if let Err(e) = with_timeout("unregister", self.register_timeout, self.registrar.unregister()).await {
                warn!(error = %e, "unregister request failed, continuing locally");
            }
        }

        self.apply(RegistrationEvent::UnregisterRequested, reason).await;

        self.store.clear().await.map_err(|e| {
            error!(error = %e, "failed to clear persisted connection state");
            e
        })
    }

    /// Apply a transport lifecycle event from the connection queue
    ///
    /// Terminal events of a connection that has since been replaced are
    /// dropped; they must not unregister the newer connection.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        let current = self.transport.connection_id();
        if event.is_terminal() && event.connection_id() != current {
            debug!(connection_id = event.connection_id(), current, "ignoring event of a replaced connection");
            return;
        }
        match event {
            TransportEvent::Opened { connection_id } => {
                debug!(connection_id, "transport opened");
            }
            TransportEvent::Closed { code, reason, .. } => {
                let reason = format!("transport closed ({}): {}", code, reason);
                self.apply(RegistrationEvent::TransportLost, &reason).await;
            }
            TransportEvent::Error { kind, message, .. } => {
                let reason = format!("transport error ({}): {}", kind, message);
                self.apply(RegistrationEvent::TransportLost, &reason).await;
            }
        }
    }

    /// Consume the connection's event queue until it closes
    pub async fn run_event_loop(self: Arc<Self>, mut queue: mpsc::Receiver<TransportEvent>) {
        debug!("registration event loop started");
        while let Some(event) = queue.recv().await {
            self.handle_transport_event(event).await;
        }
        debug!("registration event loop stopped");
    }

    /// Apply one transition; returns the new state if one was entered
    async fn apply(&self, event: RegistrationEvent, reason: &str) -> Option<RegistrationState> {
        let mut state = self.transition.lock().await;
        self.transition_locked(&mut state, event, reason).await
    }

    async fn transition_locked(
        &self,
        state: &mut RegistrationState,
        event: RegistrationEvent,
        reason: &str,
    ) -> Option<RegistrationState> {
        let previous = *state;

        let Some(next) = next_state(previous, event) else {
            debug!(state = %previous, event = ?event, "event does not apply, ignoring");
            return None;
        };

        if next == RegistrationState::Unregistered
            && previous == RegistrationState::Unregistered
            && self.sessions.is_empty()
        {
            debug!(event = ?event, "already unregistered with no sessions");
            return None;
        }

        let intentional = event == RegistrationEvent::UnregisterRequested;
        *state = next;
        *self.current.write() = next;

        if previous != next {
            info!(from = %previous, to = %next, intentional, reason = reason, "registration state changed");
            self.events.emit(CoreEvent::RegistrationStateChanged {
                previous,
                current: next,
                intentional,
            });
        }

        // The sweep runs under the transition lock: nothing else may
        // transition until every session is gone.
        if next == RegistrationState::Unregistered {
            let report = self.sessions.terminate_all(reason).await;
            for (session_id, err) in &report.errors {
                warn!(session_id = %session_id, error = %err, "session termination error");
            }
        }

        Some(next)
    }

    async fn persist(&self, config: ConnectionConfig) {
        let record = PersistedConnectionState::connected(config, now_epoch_ms());
        if let Err(e) = self.store.set(record).await {
            warn!(error = %e, "failed to persist connection state");
        }
    }
}

impl std::fmt::Debug for RegistrationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationController")
            .field("state", &self.state())
            .finish()
    }
}
