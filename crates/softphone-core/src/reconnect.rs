//! Startup reconnect after a page reload
//!
//! The [`ReconnectOrchestrator`] runs once per process. It reads the
//! persisted connection record and, when the previous page was connected
//! less than the stale threshold ago, reconnects with the stored
//! configuration and reports the outcome to the user.
//!
//! ```text
//! Idle ─► Checking ─┬─► Skipped
//!                   └─► Reconnecting ─┬─► Settling ─► Probing ─► Done
//!                                     └─► Failed
//! ```
//!
//! A failed reconnect is reported once and not retried; the user connects
//! manually.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{ConnectionConfig, CoreConfig};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::{CoreEvent, EventEmitter, Notification, Severity};
use crate::probe::{probe_with_timeout, AgentStatusProbe, ProbeOutcome};
use crate::registration::RegistrationController;
use crate::store::{now_epoch_ms, ConnectionStateStore};
use crate::transport::TransportManager;

/// Progress of the startup reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconnectState {
    Idle,
    Checking,
    Skipped,
    Reconnecting,
    Settling,
    Probing,
    Done,
    Failed,
}

impl ReconnectState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReconnectState::Skipped | ReconnectState::Done | ReconnectState::Failed)
    }
}

/// Notification describing a successful reconnect and the probe result
pub fn reconnect_notification(outcome: &ProbeOutcome) -> Notification {
    match outcome {
        ProbeOutcome::LoggedIn { agent_number } => Notification::new(
            Severity::Success,
            "Reconnected",
            format!("Connection restored. Logged in as agent {}.", agent_number),
        ),
        ProbeOutcome::NotLoggedIn => Notification::new(
            Severity::Warning,
            "Reconnected",
            "Connection restored. You are not logged in as an agent.",
        ),
        ProbeOutcome::Unavailable { error } => Notification::new(
            Severity::Info,
            "Reconnected",
            format!("Connection restored. Agent status unavailable: {}.", error),
        ),
    }
}

/// Notification describing a failed reconnect
pub fn failure_notification(error: &SoftphoneError) -> Notification {
    Notification::new(
        Severity::Error,
        "Reconnect failed",
        format!("Could not restore the connection: {}. Connect again manually.", error),
    )
}

/// Single-shot startup reconnect
pub struct ReconnectOrchestrator {
    config: CoreConfig,
    store: Arc<dyn ConnectionStateStore>,
    transport: Arc<TransportManager>,
    registration: Arc<RegistrationController>,
    probe: Arc<dyn AgentStatusProbe>,
    events: EventEmitter,
    started: AtomicBool,
    state: RwLock<ReconnectState>,
}

impl ReconnectOrchestrator {
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn ConnectionStateStore>,
        transport: Arc<TransportManager>,
        registration: Arc<RegistrationController>,
        probe: Arc<dyn AgentStatusProbe>,
        events: EventEmitter,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            registration,
            probe,
            events,
            started: AtomicBool::new(false),
            state: RwLock::new(ReconnectState::Idle),
        }
    }

    pub fn state(&self) -> ReconnectState {
        *self.state.read()
    }

    /// Run the reconnect check; returns the terminal state reached
    ///
    /// A second call fails with `AlreadyStarted` and has no effect.
    pub async fn run(&self) -> SoftphoneResult<ReconnectState> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("startup reconnect already ran");
            return Err(SoftphoneError::AlreadyStarted);
        }

        self.set_state(ReconnectState::Checking);

        let persisted = match self.store.get().await {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "could not read persisted connection state");
                None
            }
        };

        let persisted = match persisted {
            Some(p) if p.was_connected => p,
            _ => {
                info!("no previous connection to restore");
                return Ok(self.set_state(ReconnectState::Skipped));
            }
        };

        let now = now_epoch_ms();
        if persisted.is_stale(now, self.config.stale_after_ms) {
            info!(
                age_ms = persisted.age_ms(now),
                stale_after_ms = self.config.stale_after_ms,
                "persisted connection is stale, not reconnecting"
            );
            if let Err(e) = self.store.clear().await {
                warn!(error = %e, "failed to clear stale connection state");
            }
            return Ok(self.set_state(ReconnectState::Skipped));
        }

        self.set_state(ReconnectState::Reconnecting);
        let age_ms = persisted.age_ms(now);
        let config = persisted.config_snapshot;
        info!(
            server = %config.server_uri,
            username = %config.username,
            age_ms = age_ms,
            "restoring previous connection"
        );

        match self.connect_and_register(&config).await {
            Ok(()) => {}
            Err(SoftphoneError::Cancelled { operation }) => {
                info!(operation = %operation, "startup reconnect abandoned by disconnect");
                return Ok(self.set_state(ReconnectState::Skipped));
            }
            Err(e) => {
                error!(error = %e, category = e.category(), "startup reconnect failed");
                self.events.notify(failure_notification(&e));
                return Ok(self.set_state(ReconnectState::Failed));
            }
        }

        self.set_state(ReconnectState::Settling);
        tokio::time::sleep(self.config.settle_delay()).await;

        self.set_state(ReconnectState::Probing);
        let device_id = self.config.device_id_for(&config);
        let outcome = probe_with_timeout(self.probe.as_ref(), &device_id, self.config.probe_timeout()).await;
        self.events.notify(reconnect_notification(&outcome));

        Ok(self.set_state(ReconnectState::Done))
    }

    /// One attempt; on failure the transport is closed again
    async fn connect_and_register(&self, config: &ConnectionConfig) -> SoftphoneResult<()> {
        config.validate()?;
        self.transport.connect(config.clone()).await?;

        if let Err(e) = self.registration.register().await {
            if let Err(close_err) = self.transport.disconnect("registration failed").await {
                warn!(error = %close_err, "failed to close transport after registration failure");
            }
            return Err(e);
        }
        Ok(())
    }

    fn set_state(&self, state: ReconnectState) -> ReconnectState {
        *self.state.write() = state;
        self.events.emit(CoreEvent::ReconnectStateChanged { state });
        state
    }
}

impl std::fmt::Debug for ReconnectOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectOrchestrator")
            .field("state", &self.state())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}
