//! Transport connection lifecycle
//!
//! [`TransportManager`] owns the persistent connection to the signaling
//! server. The wire itself (WebSocket framing, TLS, SIP parsing) lives in an
//! injected [`SignalingTransport`]; the manager only decides what the
//! lifecycle means.
//!
//! Each physical connection gets a fresh `connection_id`. The engine reports
//! drops through [`TransportManager::report_closed`] and
//! [`TransportManager::report_error`]; those never touch registration state
//! directly. They enqueue a [`TransportEvent`] on the single-consumer queue
//! returned by [`TransportManager::new`], whose consumer applies transitions
//! one at a time.
//!
//! A connection produces exactly one `Opened` and at most one terminal event
//! (`Closed` or `Error`). Close/error races are settled by the "already
//! closed" flag: the first report wins, later ones are dropped.
//!
//! Every disconnect request advances the disconnect epoch. A connect whose
//! `open` finishes after the epoch moved is abandoned instead of marked open,
//! and [`TransportManager::disconnect_requested`] lets registration see that
//! the user has asked to leave the open connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{SoftphoneError, SoftphoneResult, TransportErrorKind};
use crate::events::{CoreEvent, EventEmitter};
use crate::recovery::with_timeout;

/// Close code used for a user-initiated disconnect
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when a connection attempt is abandoned
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Bound on closing the wire during disconnect
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// The wire-level connection engine
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open a connection to `config.server_uri`
    async fn open(&self, config: &ConnectionConfig) -> SoftphoneResult<()>;

    /// Close the current connection
    async fn close(&self, code: u16, reason: &str) -> SoftphoneResult<()>;
}

/// Lifecycle events of a physical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened {
        connection_id: u64,
    },
    Closed {
        connection_id: u64,
        code: u16,
        reason: String,
        /// Set when the close came from [`TransportManager::disconnect`]
        intentional: bool,
    },
    Error {
        connection_id: u64,
        kind: TransportErrorKind,
        message: String,
    },
}

impl TransportEvent {
    pub fn connection_id(&self) -> u64 {
        match self {
            TransportEvent::Opened { connection_id }
            | TransportEvent::Closed { connection_id, .. }
            | TransportEvent::Error { connection_id, .. } => *connection_id,
        }
    }

    /// Whether this event ends the connection
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransportEvent::Opened { .. })
    }
}

/// Owner of the connection to the signaling server
pub struct TransportManager {
    transport: Arc<dyn SignalingTransport>,
    connect_timeout: Duration,
    connection_id: AtomicU64,
    closed: AtomicBool,
    disconnect_epoch: AtomicU64,
    open_epoch: AtomicU64,
    config: RwLock<Option<ConnectionConfig>>,
    connect_lock: Mutex<()>,
    queue: mpsc::Sender<TransportEvent>,
    events: EventEmitter,
}

impl TransportManager {
    /// Create the manager and the receiving end of its event queue
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        events: EventEmitter,
        connect_timeout: Duration,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (queue, queue_rx) = mpsc::channel(queue_capacity);
        let manager = Self {
            transport,
            connect_timeout,
            connection_id: AtomicU64::new(0),
            closed: AtomicBool::new(true),
            disconnect_epoch: AtomicU64::new(0),
            open_epoch: AtomicU64::new(0),
            config: RwLock::new(None),
            connect_lock: Mutex::new(()),
            queue,
            events,
        };
        (manager, queue_rx)
    }

    /// Open a connection, returning its id
    ///
    /// Already connected is success. Fails with a `Transport` error whose kind
    /// is `Timeout` when the attempt exceeds the connect bound, and with
    /// `Cancelled` when a disconnect was requested while `open` was pending.
    pub async fn connect(&self, config: ConnectionConfig) -> SoftphoneResult<u64> {
        let _guard = self.connect_lock.lock().await;

        if self.is_connected() {
            let id = self.connection_id();
            debug!(connection_id = id, "connect requested while connected");
            return Ok(id);
        }

        let epoch = self.disconnect_epoch.load(Ordering::SeqCst);
        let id = self.connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        info!(connection_id = id, server = %config.server_uri, "opening transport");

        let result = with_timeout("connect", self.connect_timeout, self.transport.open(&config)).await;
        match result {
            Ok(()) if self.disconnect_epoch.load(Ordering::SeqCst) != epoch => {
                info!(connection_id = id, "disconnect requested while opening, abandoning connection");
                let close = self.transport.close(NORMAL_CLOSURE, "cancelled");
                if let Err(e) = with_timeout("close", CLOSE_TIMEOUT, close).await {
                    debug!(error = %e, "closing abandoned connection failed");
                }
                self.publish(TransportEvent::Closed {
                    connection_id: id,
                    code: NORMAL_CLOSURE,
                    reason: "cancelled".to_string(),
                    intentional: true,
                })
                .await;
                Err(SoftphoneError::cancelled("connect"))
            }
            Ok(()) => {
                *self.config.write() = Some(config);
                self.open_epoch.store(epoch, Ordering::SeqCst);
                self.closed.store(false, Ordering::SeqCst);
                info!(connection_id = id, "transport open");
                self.publish(TransportEvent::Opened { connection_id: id }).await;
                Ok(id)
            }
            Err(e) => {
                let kind = e.transport_kind().unwrap_or(TransportErrorKind::Network);
                warn!(connection_id = id, error = %e, kind = %kind, "transport connect failed");
                if kind == TransportErrorKind::Timeout {
                    self.abandon_attempt().await;
                }
                self.publish(TransportEvent::Error {
                    connection_id: id,
                    kind,
                    message: e.to_string(),
                })
                .await;
                Err(match e {
                    transport_err @ SoftphoneError::Transport { .. } => transport_err,
                    other => SoftphoneError::transport(kind, other.to_string()),
                })
            }
        }
    }

    /// Record that the user wants to be disconnected
    ///
    /// A pending connect is abandoned once its `open` returns, and
    /// registration stops treating the open connection as usable.
    pub fn request_disconnect(&self) {
        let epoch = self.disconnect_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "disconnect requested");
    }

    /// Whether a disconnect was requested since the current connection opened
    pub fn disconnect_requested(&self) -> bool {
        self.disconnect_epoch.load(Ordering::SeqCst) != self.open_epoch.load(Ordering::SeqCst)
    }

    /// Close the current connection; repeated calls are no-ops
    ///
    /// Also cancels a connect that is still waiting for `open`.
    pub async fn disconnect(&self, reason: &str) -> SoftphoneResult<()> {
        self.request_disconnect();
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(reason = reason, "disconnect requested, transport already closed");
            return Ok(());
        }
        let id = self.connection_id();
        info!(connection_id = id, reason = reason, "closing transport");

        if let Err(e) = with_timeout("close", CLOSE_TIMEOUT, self.transport.close(NORMAL_CLOSURE, reason)).await {
            warn!(connection_id = id, error = %e, "transport close failed, treating as closed");
        }

        self.publish(TransportEvent::Closed {
            connection_id: id,
            code: NORMAL_CLOSURE,
            reason: reason.to_string(),
            intentional: true,
        })
        .await;
        Ok(())
    }

    /// Engine callback: the connection closed
    ///
    /// Returns whether the report was accepted; reports for an older
    /// connection or an already closed one are dropped.
    pub async fn report_closed(&self, connection_id: u64, code: u16, reason: &str) -> bool {
        if !self.claim_close(connection_id) {
            return false;
        }
        warn!(connection_id, code, reason = reason, "transport closed");
        self.publish(TransportEvent::Closed {
            connection_id,
            code,
            reason: reason.to_string(),
            intentional: false,
        })
        .await;
        true
    }

    /// Engine callback: the connection failed
    pub async fn report_error(&self, connection_id: u64, kind: TransportErrorKind, message: &str) -> bool {
        if !self.claim_close(connection_id) {
            return false;
        }
        warn!(connection_id, kind = %kind, message = message, "transport error");
        self.publish(TransportEvent::Error {
            connection_id,
            kind,
            message: message.to_string(),
        })
        .await;
        true
    }

    fn claim_close(&self, connection_id: u64) -> bool {
        let current = self.connection_id();
        if connection_id != current {
            debug!(connection_id, current, "ignoring report for a previous connection");
            return false;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(connection_id, "ignoring report, connection already closed");
            return false;
        }
        true
    }

    async fn abandon_attempt(&self) {
        if let Err(e) = with_timeout(
            "close",
            CLOSE_TIMEOUT,
            self.transport.close(ABNORMAL_CLOSURE, "connect timeout"),
        )
        .await
        {
            debug!(error = %e, "abandoning connect attempt failed");
        }
    }

    async fn publish(&self, event: TransportEvent) {
        self.events.emit(CoreEvent::Transport(event.clone()));
        if self.queue.send(event).await.is_err() {
            debug!("transport queue has no consumer");
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Id of the current (or most recent) connection; 0 before the first attempt
    pub fn connection_id(&self) -> u64 {
        self.connection_id.load(Ordering::SeqCst)
    }

    /// Configuration of the open connection, unless a disconnect is pending
    pub fn current_config(&self) -> Option<ConnectionConfig> {
        if self.is_connected() && !self.disconnect_requested() {
            self.config.read().clone()
        } else {
            None
        }
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("connection_id", &self.connection_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}
