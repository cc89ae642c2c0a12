//! Error types for the softphone core
//!
//! Every fallible operation in this crate returns [`SoftphoneResult`]. The
//! variants follow the failure taxonomy of the connection lifecycle:
//!
//! - **Transport** and **Registration** errors abort the current connection
//!   attempt. They are surfaced to the user, never retried automatically.
//! - **InvalidTransition** and **DuplicateSession** are local to one call
//!   session and never affect other sessions or the registration.
//! - **Probe** errors are downgraded to an informational notification.

use thiserror::Error;

/// Result type for softphone core operations
pub type SoftphoneResult<T> = Result<T, SoftphoneError>;

/// Why a transport connection attempt or connection failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Generic network failure (DNS, reset, unreachable host)
    Network,
    /// TLS handshake or certificate failure
    Tls,
    /// The server actively refused the connection
    Refused,
    /// The connection attempt did not complete in time
    Timeout,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Network => write!(f, "network"),
            TransportErrorKind::Tls => write!(f, "tls"),
            TransportErrorKind::Refused => write!(f, "refused"),
            TransportErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Why a registration attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationErrorKind {
    /// The registrar rejected the request
    Rejected,
    /// Credentials were not accepted
    AuthFailed,
    /// No final response arrived in time
    Timeout,
    /// Registration was requested without an open transport
    NotConnected,
    /// Another registration attempt is still waiting for its response
    InProgress,
}

impl std::fmt::Display for RegistrationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationErrorKind::Rejected => write!(f, "rejected"),
            RegistrationErrorKind::AuthFailed => write!(f, "authentication failed"),
            RegistrationErrorKind::Timeout => write!(f, "timeout"),
            RegistrationErrorKind::NotConnected => write!(f, "not connected"),
            RegistrationErrorKind::InProgress => write!(f, "in progress"),
        }
    }
}

/// Failures of the agent status probe
///
/// Kept apart from [`SoftphoneError`] because a probe failure is never fatal:
/// it only changes which notification is shown after a reconnect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("agent status query timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("agent status service unreachable: {message}")]
    Unreachable { message: String },

    #[error("invalid agent status response: {message}")]
    InvalidResponse { message: String },
}

/// Errors that can occur in the softphone core
#[derive(Debug, Clone, Error)]
pub enum SoftphoneError {
    /// Transport connection failed or was lost
    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Registration with the signaling server failed
    #[error("Registration error ({kind}): {message}")]
    Registration {
        kind: RegistrationErrorKind,
        message: String,
    },

    /// A call session was asked to make a transition it does not allow
    #[error("Invalid transition for session {session_id}: {from} -> {to}")]
    InvalidTransition {
        session_id: String,
        from: String,
        to: String,
    },

    /// A dialog was reported twice with the same identifier
    #[error("Duplicate session: {session_id}")]
    DuplicateSession { session_id: String },

    /// No session exists with this identifier
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Agent status probe failed
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// The persisted connection state could not be read or written
    #[error("State store error: {message}")]
    StateStore { message: String },

    /// Invalid configuration value
    #[error("Invalid configuration for {field}: {reason}")]
    Configuration { field: String, reason: String },

    /// A run-once component was started a second time
    #[error("Operation already started")]
    AlreadyStarted,

    /// A bounded wait elapsed
    #[error("{operation} timed out after {duration_ms}ms")]
    OperationTimeout { operation: String, duration_ms: u64 },

    /// The user disconnected while the operation was in flight
    #[error("{operation} cancelled by disconnect")]
    Cancelled { operation: String },
}

impl SoftphoneError {
    /// Create a transport error of the given kind
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Create a network transport error
    pub fn network(message: impl Into<String>) -> Self {
        Self::transport(TransportErrorKind::Network, message)
    }

    /// Create a TLS transport error
    pub fn tls(message: impl Into<String>) -> Self {
        Self::transport(TransportErrorKind::Tls, message)
    }

    /// Create a connection-refused transport error
    pub fn refused(message: impl Into<String>) -> Self {
        Self::transport(TransportErrorKind::Refused, message)
    }

    /// Create a registration error of the given kind
    pub fn registration(kind: RegistrationErrorKind, message: impl Into<String>) -> Self {
        Self::Registration {
            kind,
            message: message.into(),
        }
    }

    /// Create a state store error
    pub fn state_store(message: impl Into<String>) -> Self {
        Self::StateStore {
            message: message.into(),
        }
    }

    /// Create a cancellation error for `operation`
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Short label used as a structured logging field
    pub fn category(&self) -> &'static str {
        match self {
            SoftphoneError::Transport { .. } => "transport",
            SoftphoneError::Registration { .. } => "registration",
            SoftphoneError::InvalidTransition { .. } => "session_transition",
            SoftphoneError::DuplicateSession { .. } => "duplicate_session",
            SoftphoneError::SessionNotFound { .. } => "session_not_found",
            SoftphoneError::Probe(_) => "probe",
            SoftphoneError::StateStore { .. } => "state_store",
            SoftphoneError::Configuration { .. } => "configuration",
            SoftphoneError::AlreadyStarted => "already_started",
            SoftphoneError::OperationTimeout { .. } => "timeout",
            SoftphoneError::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether a manual retry by the user could succeed
    ///
    /// Nothing in this crate retries automatically; this only drives how the
    /// failure is worded to the user.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SoftphoneError::Transport { kind, .. } => !matches!(kind, TransportErrorKind::Tls),
            SoftphoneError::Registration { kind, .. } => {
                !matches!(kind, RegistrationErrorKind::AuthFailed)
            }
            SoftphoneError::OperationTimeout { .. } => true,
            SoftphoneError::Probe(_) => true,
            SoftphoneError::Cancelled { .. } => true,
            _ => false,
        }
    }

    /// Transport failure kind, mapping bounded-wait timeouts to `Timeout`
    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            SoftphoneError::Transport { kind, .. } => Some(*kind),
            SoftphoneError::OperationTimeout { .. } => Some(TransportErrorKind::Timeout),
            _ => None,
        }
    }
}
