//! Per-instance facade over the connection lifecycle
//!
//! [`SoftphoneClient`] wires the components of one core instance together
//! and starts the single consumer of the transport event queue.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                SoftphoneClient               │
//! │                                              │
//! │  ReconnectOrchestrator ──► TransportManager  │
//! │          │                      │ queue      │
//! │          ▼                      ▼            │
//! │  AgentStatusProbe     RegistrationController │
//! │                                 │            │
//! │  ConnectionStateStore ◄─────────┤            │
//! │                                 ▼            │
//! │                          SessionManager      │
//! └──────────────────────────────────────────────┘
//!                    │ CoreEvent
//!                    ▼
//!      UI / status light / tone player
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConnectionConfig, CoreConfig};
use crate::error::SoftphoneResult;
use crate::events::{EventEmitter, EventIterator};
use crate::probe::AgentStatusProbe;
use crate::reconnect::{ReconnectOrchestrator, ReconnectState};
use crate::registration::{Registrar, RegistrationController, RegistrationState};
use crate::session::{SessionManager, SessionSignaling};
use crate::store::ConnectionStateStore;
use crate::transport::{SignalingTransport, TransportManager};

/// External collaborators injected into a client
#[derive(Clone)]
pub struct SoftphoneComponents {
    pub transport: Arc<dyn SignalingTransport>,
    pub registrar: Arc<dyn Registrar>,
    pub signaling: Arc<dyn SessionSignaling>,
    pub store: Arc<dyn ConnectionStateStore>,
    pub probe: Arc<dyn AgentStatusProbe>,
}

/// One connection instance of the softphone core
pub struct SoftphoneClient {
    instance_id: Uuid,
    events: EventEmitter,
    transport: Arc<TransportManager>,
    registration: Arc<RegistrationController>,
    sessions: Arc<SessionManager>,
    orchestrator: ReconnectOrchestrator,
    event_loop: JoinHandle<()>,
}

impl SoftphoneClient {
    /// Build the client and start its event loop
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: CoreConfig, components: SoftphoneComponents) -> SoftphoneResult<Self> {
        config.validate()?;
        let instance_id = Uuid::new_v4();
        let events = EventEmitter::new(config.event_channel_capacity);

        let (transport, queue) = TransportManager::new(
            components.transport,
            events.clone(),
            config.connect_timeout(),
            config.event_channel_capacity,
        );
        let transport = Arc::new(transport);

        let sessions = Arc::new(SessionManager::new(
            components.signaling,
            events.clone(),
            config.graceful_termination_timeout(),
        ));

        let registration = Arc::new(RegistrationController::new(
            components.registrar,
            transport.clone(),
            sessions.clone(),
            components.store.clone(),
            events.clone(),
            config.register_timeout(),
        ));

        let span = tracing::info_span!("softphone", instance = %instance_id);
        let event_loop = tokio::spawn(registration.clone().run_event_loop(queue).instrument(span));

        let orchestrator = ReconnectOrchestrator::new(
            config,
            components.store,
            transport.clone(),
            registration.clone(),
            components.probe,
            events.clone(),
        );

        info!(instance = %instance_id, "softphone core created");
        Ok(Self {
            instance_id,
            events,
            transport,
            registration,
            sessions,
            orchestrator,
            event_loop,
        })
    }

    /// Restore the previous connection if the persisted record allows it
    pub async fn reconnect_on_startup(&self) -> SoftphoneResult<ReconnectState> {
        self.orchestrator.run().await
    }

    /// Connect and register on the user's request
    ///
    /// An invalid configuration fails with `Configuration` before anything is
    /// opened.
    pub async fn connect(&self, config: ConnectionConfig) -> SoftphoneResult<()> {
        config.validate()?;
        self.transport.connect(config).await?;
        if let Err(e) = self.registration.register().await {
            if let Err(close_err) = self.transport.disconnect("registration failed").await {
                warn!(error = %close_err, "failed to close transport after registration failure");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Disconnect on the user's request
    ///
    /// Ends all calls, closes the transport and clears the persisted record
    /// so a later startup stays disconnected. A connect or reconnect still in
    /// flight is abandoned. Safe to call repeatedly.
    pub async fn disconnect(&self, reason: &str) -> SoftphoneResult<()> {
        info!(instance = %self.instance_id, reason = reason, "user disconnect");
        self.transport.request_disconnect();
        let unregistered = self.registration.unregister(reason).await;
        self.transport.disconnect(reason).await?;
        unregistered
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn subscribe(&self) -> EventIterator {
        self.events.subscribe_simple()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn transport(&self) -> &Arc<TransportManager> {
        &self.transport
    }

    pub fn registration(&self) -> &Arc<RegistrationController> {
        &self.registration
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration.state()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.orchestrator.state()
    }
}

impl Drop for SoftphoneClient {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

impl std::fmt::Debug for SoftphoneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftphoneClient")
            .field("instance_id", &self.instance_id)
            .field("transport", &self.transport)
            .field("registration", &self.registration)
            .field("sessions", &self.sessions)
            .field("reconnect", &self.orchestrator)
            .finish()
    }
}
