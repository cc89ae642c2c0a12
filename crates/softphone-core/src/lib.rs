//! # Softphone Core - Connection and Session Lifecycle
//!
//! The state-machine core of a browser softphone. It owns the transport
//! connection to the call-signaling server, drives registration, tracks
//! in-flight call sessions and restores the connection after a page reload.
//!
//! Wire protocols, media negotiation, rendering and persistence backends are
//! injected collaborators; this crate decides what their events mean.
//!
//! ## Guarantees
//!
//! - Whenever registration is lost or the transport closes, every call
//!   session is terminated: gracefully where possible, forcibly after a
//!   bounded wait.
//! - Transport and registration events of one instance are applied one at a
//!   time, in arrival order.
//! - Every asynchronous step (connect, register, probe, graceful hangup) is
//!   bounded by a timeout.
//! - A failed startup reconnect is reported once and never retried.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use softphone_core::{
//!     ConnectionConfig, CoreConfig, MemoryStateStore, SoftphoneClient, SoftphoneComponents,
//! };
//! # use softphone_core::{SignalingTransport, Registrar, SessionSignaling, AgentStatusProbe};
//! # async fn example(
//! #     transport: Arc<dyn SignalingTransport>,
//! #     registrar: Arc<dyn Registrar>,
//! #     signaling: Arc<dyn SessionSignaling>,
//! #     probe: Arc<dyn AgentStatusProbe>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let client = SoftphoneClient::new(
//!     CoreConfig::default(),
//!     SoftphoneComponents {
//!         transport,
//!         registrar,
//!         signaling,
//!         store: Arc::new(MemoryStateStore::new()),
//!         probe,
//!     },
//! )?;
//!
//! // After a reload: reconnect if the previous page was connected
//! client.reconnect_on_startup().await?;
//!
//! // Or connect explicitly
//! client
//!     .connect(ConnectionConfig::new("wss://pbx.example.com/ws", "1001").with_credential("secret"))
//!     .await?;
//!
//! let mut events = client.subscribe();
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod probe;
pub mod reconnect;
pub mod recovery;
pub mod registration;
pub mod session;
pub mod store;
pub mod transport;

pub use client::{SoftphoneClient, SoftphoneComponents};
pub use config::{ConnectionConfig, CoreConfig};
pub use error::{ProbeError, RegistrationErrorKind, SoftphoneError, SoftphoneResult, TransportErrorKind};
pub use events::{CoreEvent, EventEmitter, EventIterator, Notification, SessionStateChange, Severity};
pub use probe::{AgentStatus, AgentStatusProbe, ProbeOutcome};
pub use reconnect::{ReconnectOrchestrator, ReconnectState};
pub use registration::{Registrar, RegistrationController, RegistrationState};
pub use session::{CallDirection, CallSession, SessionManager, SessionSignaling, SessionState, TerminationReport};
pub use store::{ConnectionStateStore, FileStateStore, MemoryStateStore, PersistedConnectionState};
pub use transport::{SignalingTransport, TransportEvent, TransportManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
