//! Connection and core configuration
//!
//! Two configuration values drive the core:
//!
//! - [`ConnectionConfig`] - who to connect as and where. Immutable for the
//!   duration of one connection attempt; a snapshot of it is what gets
//!   persisted for reload recovery.
//! - [`CoreConfig`] - timing bounds and identity for this instance.
//!
//! # Usage Examples
//!
//! ```rust
//! use softphone_core::config::{ConnectionConfig, CoreConfig};
//! use std::time::Duration;
//!
//! let connection = ConnectionConfig::new("wss://pbx.example.com:8089/ws", "1001")
//!     .with_credential("secret")
//!     .with_display_name("Front Desk");
//! assert!(connection.validate().is_ok());
//!
//! let core = CoreConfig::new()
//!     .with_settle_delay(Duration::from_millis(500))
//!     .with_device_id("desk-phone-7");
//! assert_eq!(core.settle_delay(), Duration::from_millis(500));
//! assert_eq!(core.device_id_for(&connection), "desk-phone-7");
//! ```

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{SoftphoneError, SoftphoneResult};

/// How long a persisted connection record stays eligible for auto-reconnect
pub const DEFAULT_STALE_AFTER_MS: u64 = 300_000;

/// Parameters of one connection attempt to the signaling server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Signaling server URI, e.g. `wss://pbx.example.com:8089/ws`
    pub server_uri: String,
    /// Account / extension name
    pub username: String,
    /// Authentication secret
    pub credential: String,
    /// Display name presented to remote parties
    pub display_name: String,
}

impl ConnectionConfig {
    /// Create a configuration with an empty credential and display name
    pub fn new(server_uri: impl Into<String>, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            server_uri: server_uri.into(),
            display_name: username.clone(),
            username,
            credential: String::new(),
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Check that the configuration can be used for a connection attempt
    pub fn validate(&self) -> SoftphoneResult<()> {
        if self.server_uri.trim().is_empty() {
            return Err(SoftphoneError::config("server_uri", "must not be empty"));
        }
        const SCHEMES: [&str; 4] = ["ws://", "wss://", "sip:", "sips:"];
        if !SCHEMES.iter().any(|scheme| self.server_uri.starts_with(scheme)) {
            return Err(SoftphoneError::config(
                "server_uri",
                format!("unsupported scheme in '{}'", self.server_uri),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(SoftphoneError::config("username", "must not be empty"));
        }
        Ok(())
    }
}

// The credential never reaches logs.
impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("server_uri", &self.server_uri)
            .field("username", &self.username)
            .field("credential", &"<redacted>")
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Timing bounds and identity of one core instance
///
/// Every asynchronous step of the connection lifecycle has a bound here, so
/// no step can block indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Bound on establishing the transport connection
    pub connect_timeout_ms: u64,
    /// Bound on a registration round trip
    pub register_timeout_ms: u64,
    /// Bound on the agent status probe, independent of registration
    pub probe_timeout_ms: u64,
    /// Bound on the graceful end of one established session
    pub graceful_termination_timeout_ms: u64,
    /// Pause between a successful reconnect and the status probe
    pub settle_delay_ms: u64,
    /// Age after which a persisted connection record is ignored
    pub stale_after_ms: u64,
    /// Identifier sent to the agent status probe; defaults to the username
    pub device_id: Option<String>,
    /// Capacity of the event broadcast channel and the transport queue
    pub event_channel_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            register_timeout_ms: 10_000,
            probe_timeout_ms: 5_000,
            graceful_termination_timeout_ms: 2_000,
            settle_delay_ms: 1_000,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            device_id: None,
            event_channel_capacity: 100,
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_graceful_termination_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_termination_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after_ms = age.as_millis() as u64;
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn graceful_termination_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_termination_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Device identifier for the probe, falling back to the account username
    pub fn device_id_for(&self, connection: &ConnectionConfig) -> String {
        self.device_id
            .clone()
            .unwrap_or_else(|| connection.username.clone())
    }

    /// Reject values that would make a bounded wait meaningless
    pub fn validate(&self) -> SoftphoneResult<()> {
        let bounds = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("register_timeout_ms", self.register_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("graceful_termination_timeout_ms", self.graceful_termination_timeout_ms),
            ("stale_after_ms", self.stale_after_ms),
        ];
        for (field, value) in bounds {
            if value == 0 {
                return Err(SoftphoneError::config(field, "must be greater than zero"));
            }
        }
        if self.event_channel_capacity == 0 {
            return Err(SoftphoneError::config(
                "event_channel_capacity",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}
