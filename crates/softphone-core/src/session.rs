//! Call session tracking and mandatory termination
//!
//! The [`SessionManager`] exclusively owns every in-flight call session. A
//! session is created when the protocol engine reports a new dialog and is
//! destroyed once it reached `Terminated` and its media and timers were
//! released.
//!
//! # Session lifecycle
//!
//! ```text
//! Initiating ──► Connecting ──► Established
//!     │              │               │
//!     └──────────────┴───────┬───────┘
//!                            ▼
//!                       Terminating ──► Terminated (removed)
//! ```
//!
//! Any other requested transition is rejected and the session is forced into
//! `Terminating`, so a confused dialog never lingers half-alive.
//!
//! # Termination sweep
//!
//! [`SessionManager::terminate_all`] is the guarantee that no call outlives
//! its registration: established calls get a graceful hangup under a bounded
//! wait, earlier calls get a cancel, every session is driven to `Terminated`
//! and removed. Sessions are ended concurrently and the sweep never fails.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::{CoreEvent, EventEmitter, SessionStateChange};
use crate::recovery::with_timeout;

/// Direction of a call relative to this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Lifecycle state of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Initiating,
    Connecting,
    Established,
    Terminating,
    Terminated,
}

impl SessionState {
    /// Whether `self -> next` is one of the allowed transitions
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initiating, Connecting)
                | (Connecting, Established)
                | (Established, Terminating)
                | (Initiating, Terminating)
                | (Connecting, Terminating)
                | (Terminating, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Terminated
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initiating => "Initiating",
            SessionState::Connecting => "Connecting",
            SessionState::Established => "Established",
            SessionState::Terminating => "Terminating",
            SessionState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// One call's signaling-and-media lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    /// Dialog identifier, unique among live sessions
    pub id: String,
    pub direction: CallDirection,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    /// Set when the session reaches `Established`
    pub answered_at: Option<DateTime<Utc>>,
    pub remote_identity: String,
}

/// Dialog-level operations of the protocol engine
///
/// `release` frees media and timers of a finished session; its completion is
/// the cleanup confirmation after which the session is destroyed.
#[async_trait]
pub trait SessionSignaling: Send + Sync {
    /// End an established dialog gracefully
    async fn hangup(&self, session_id: &str) -> SoftphoneResult<()>;

    /// Abandon a dialog that was never answered
    async fn cancel(&self, session_id: &str) -> SoftphoneResult<()>;

    /// Release media and timers of a terminated dialog
    async fn release(&self, session_id: &str) -> SoftphoneResult<()>;
}

/// Outcome of one [`SessionManager::terminate_all`] sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Sessions whose hangup or cancel was acknowledged in time
    pub graceful: Vec<String>,
    /// Sessions terminated without acknowledgement
    pub forced: Vec<String>,
    /// Per-session errors, collected rather than propagated
    pub errors: Vec<(String, String)>,
}

impl TerminationReport {
    pub fn is_empty(&self) -> bool {
        self.graceful.is_empty() && self.forced.is_empty()
    }

    pub fn total(&self) -> usize {
        self.graceful.len() + self.forced.len()
    }
}

/// Snapshot of session counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub active: usize,
    pub initiating: usize,
    pub connecting: usize,
    pub established: usize,
    pub terminating: usize,
    pub total_created: u64,
    pub total_terminated: u64,
    /// Number of `terminate_all` invocations
    pub sweeps: u64,
}

struct SessionOutcome {
    session_id: String,
    graceful: bool,
    errors: Vec<String>,
}

/// Owner of the set of active call sessions
pub struct SessionManager {
    sessions: DashMap<String, CallSession>,
    signaling: Arc<dyn SessionSignaling>,
    events: EventEmitter,
    graceful_timeout: Duration,
    total_created: AtomicU64,
    total_terminated: AtomicU64,
    sweeps: AtomicU64,
    /// Woken whenever a session leaves the map
    removed: Notify,
}

impl SessionManager {
    pub fn new(
        signaling: Arc<dyn SessionSignaling>,
        events: EventEmitter,
        graceful_timeout: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            signaling,
            events,
            graceful_timeout,
            total_created: AtomicU64::new(0),
            total_terminated: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            removed: Notify::new(),
        }
    }

    /// Track a new dialog in `Initiating`
    ///
    /// Fails with `DuplicateSession` if the id is already tracked; the existing
    /// session is left untouched.
    pub fn on_dialog_created(
        &self,
        id: impl Into<String>,
        direction: CallDirection,
        remote_identity: impl Into<String>,
    ) -> SoftphoneResult<CallSession> {
        let id = id.into();
        let session = CallSession {
            id: id.clone(),
            direction,
            state: SessionState::Initiating,
            started_at: Utc::now(),
            answered_at: None,
            remote_identity: remote_identity.into(),
        };

        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(session_id = %id, "dialog reported twice, rejecting duplicate");
                return Err(SoftphoneError::DuplicateSession { session_id: id });
            }
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }

        self.total_created.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %id, direction = ?direction, remote = %session.remote_identity, "session created");
        self.publish(&id, None, SessionState::Initiating, direction);
        Ok(session)
    }

    /// Move a session to `new_state`
    ///
    /// A transition outside the allowed set fails with `InvalidTransition`
    /// and forces the session into `Terminating`. Reaching `Terminated`
    /// releases the session's resources and removes it.
    pub async fn update_state(&self, id: &str, new_state: SessionState) -> SoftphoneResult<SessionState> {
        let (previous, direction) = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| SoftphoneError::SessionNotFound { session_id: id.to_string() })?;
            let previous = session.state;
            let direction = session.direction;

            if !previous.can_transition_to(new_state) {
                warn!(
                    session_id = %id,
                    from = %previous,
                    to = %new_state,
                    "rejected session transition, forcing Terminating"
                );
                let forced = previous != SessionState::Terminating;
                if forced {
                    session.state = SessionState::Terminating;
                }
                drop(session);
                if forced {
                    self.publish(id, Some(previous), SessionState::Terminating, direction);
                }
                return Err(SoftphoneError::InvalidTransition {
                    session_id: id.to_string(),
                    from: previous.to_string(),
                    to: new_state.to_string(),
                });
            }

            session.state = new_state;
            if new_state == SessionState::Established {
                session.answered_at = Some(Utc::now());
            }
            (previous, direction)
        };

        debug!(session_id = %id, from = %previous, to = %new_state, "session transition");
        self.publish(id, Some(previous), new_state, direction);

        if new_state == SessionState::Terminated {
            if let Err(e) = self.finalize(id).await {
                warn!(session_id = %id, error = %e, "session cleanup failed");
            }
        }
        Ok(new_state)
    }

    /// End every live session and wait until all are gone
    ///
    /// Never fails: per-session problems land in the report. When the call
    /// returns the session set is empty. Sessions already being finished by
    /// another caller are waited for, up to the graceful bound, and then
    /// removed by force.
    pub async fn terminate_all(&self, reason: &str) -> TerminationReport {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        let mut report = TerminationReport::default();

        loop {
            // Registered before the snapshot so no removal is missed
            let removed = self.removed.notified();
            tokio::pin!(removed);
            removed.as_mut().enable();

            let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
            if ids.is_empty() {
                break;
            }

            info!(count = ids.len(), reason = reason, "terminating all sessions");
            let outcomes = join_all(ids.into_iter().map(|id| self.terminate_one(id))).await;

            let mut progressed = false;
            for outcome in outcomes.into_iter().flatten() {
                progressed = true;
                for err in outcome.errors {
                    report.errors.push((outcome.session_id.clone(), err));
                }
                if outcome.graceful {
                    report.graceful.push(outcome.session_id);
                } else {
                    report.forced.push(outcome.session_id);
                }
            }

            if !progressed {
                debug!("remaining sessions are finishing elsewhere, waiting");
                if tokio::time::timeout(self.graceful_timeout, removed).await.is_err() {
                    report.forced.extend(self.reap_terminated());
                }
            }
        }

        if report.is_empty() {
            debug!(reason = reason, "no sessions left to terminate");
        } else {
            info!(
                graceful = report.graceful.len(),
                forced = report.forced.len(),
                errors = report.errors.len(),
                "all sessions terminated"
            );
        }
        report
    }

    /// Drive one session to `Terminated`; `None` if it was already gone
    async fn terminate_one(&self, id: String) -> Option<SessionOutcome> {
        let (previous, direction) = {
            let mut session = self.sessions.get_mut(&id)?;
            let previous = session.state;
            if previous == SessionState::Terminated {
                return None;
            }
            session.state = SessionState::Terminating;
            (previous, session.direction)
        };
        if previous != SessionState::Terminating {
            self.publish(&id, Some(previous), SessionState::Terminating, direction);
        }

        let mut errors = Vec::new();
        let signal = match previous {
            SessionState::Established => Some(
                with_timeout("graceful_hangup", self.graceful_timeout, self.signaling.hangup(&id)).await,
            ),
            SessionState::Initiating | SessionState::Connecting => Some(
                with_timeout("cancel", self.graceful_timeout, self.signaling.cancel(&id)).await,
            ),
            // Already on its way out; only the forced finish remains.
            SessionState::Terminating | SessionState::Terminated => None,
        };

        let graceful = match signal {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!(session_id = %id, error = %e, category = e.category(), "graceful termination failed, forcing");
                errors.push(e.to_string());
                false
            }
            None => false,
        };

        // Another path may have finished the session while we waited.
        let claimed = match self.sessions.get_mut(&id) {
            Some(mut session) if session.state == SessionState::Terminating => {
                session.state = SessionState::Terminated;
                true
            }
            _ => false,
        };
        if !claimed {
            return None;
        }
        self.publish(&id, Some(SessionState::Terminating), SessionState::Terminated, direction);

        if let Err(e) = self.finalize(&id).await {
            errors.push(e.to_string());
        }

        Some(SessionOutcome {
            session_id: id,
            graceful,
            errors,
        })
    }

    /// Release resources and forget a terminated session
    async fn finalize(&self, id: &str) -> SoftphoneResult<()> {
        let released = with_timeout("release", self.graceful_timeout, self.signaling.release(id)).await;
        if let Err(e) = &released {
            error!(session_id = %id, error = %e, "media release failed, removing session anyway");
        }
        if self.sessions.remove(id).is_some() {
            self.total_terminated.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %id, "session removed");
        }
        self.removed.notify_waiters();
        released
    }

    /// Drop sessions stuck in `Terminated` whose cleanup never finished
    fn reap_terminated(&self) -> Vec<String> {
        let stuck: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.state == SessionState::Terminated)
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = Vec::new();
        for id in stuck {
            if self
                .sessions
                .remove_if(&id, |_, session| session.state == SessionState::Terminated)
                .is_some()
            {
                warn!(session_id = %id, "session cleanup did not finish, removing");
                self.total_terminated.fetch_add(1, Ordering::Relaxed);
                reaped.push(id);
            }
        }
        if !reaped.is_empty() {
            self.removed.notify_waiters();
        }
        reaped
    }

    fn publish(
        &self,
        id: &str,
        previous_state: Option<SessionState>,
        new_state: SessionState,
        direction: CallDirection,
    ) {
        self.events.emit(CoreEvent::SessionStateChanged(SessionStateChange {
            session_id: id.to_string(),
            previous_state,
            new_state,
            direction,
        }));
    }

    pub fn get(&self, id: &str) -> Option<CallSession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<CallSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_terminated: self.total_terminated.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            ..Default::default()
        };
        for session in self.sessions.iter() {
            stats.active += 1;
            match session.state {
                SessionState::Initiating => stats.initiating += 1,
                SessionState::Connecting => stats.connecting += 1,
                SessionState::Established => stats.established += 1,
                SessionState::Terminating => stats.terminating += 1,
                SessionState::Terminated => {}
            }
        }
        stats
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("graceful_timeout", &self.graceful_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSignaling {
        calls: Mutex<Vec<String>>,
        release_delay: Option<Duration>,
    }

    #[async_trait]
    impl SessionSignaling for RecordingSignaling {
        async fn hangup(&self, session_id: &str) -> SoftphoneResult<()> {
            self.calls.lock().push(format!("hangup:{}", session_id));
            Ok(())
        }

        async fn cancel(&self, session_id: &str) -> SoftphoneResult<()> {
            self.calls.lock().push(format!("cancel:{}", session_id));
            Ok(())
        }

        async fn release(&self, session_id: &str) -> SoftphoneResult<()> {
            self.calls.lock().push(format!("release:{}", session_id));
            if let Some(delay) = self.release_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }
    }

    fn manager() -> (SessionManager, Arc<RecordingSignaling>) {
        let signaling = Arc::new(RecordingSignaling::default());
        let manager = SessionManager::new(signaling.clone(), EventEmitter::new(64), Duration::from_millis(200));
        (manager, signaling)
    }

    #[test]
    fn test_allowed_transitions() {
        use SessionState::*;
        assert!(Initiating.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Established));
        assert!(Established.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));
        assert!(!Initiating.can_transition_to(Established));
        assert!(!Established.can_transition_to(Connecting));
        assert!(!Terminated.can_transition_to(Initiating));
        assert!(!Established.can_transition_to(Terminated));
    }

    #[tokio::test]
    async fn test_full_lifecycle_removes_session() {
        let (manager, signaling) = manager();
        manager.on_dialog_created("dlg-1", CallDirection::Outbound, "sip:200@pbx").unwrap();

        manager.update_state("dlg-1", SessionState::Connecting).await.unwrap();
        manager.update_state("dlg-1", SessionState::Established).await.unwrap();
        assert!(manager.get("dlg-1").unwrap().answered_at.is_some());

        manager.update_state("dlg-1", SessionState::Terminating).await.unwrap();
        manager.update_state("dlg-1", SessionState::Terminated).await.unwrap();

        assert!(manager.is_empty());
        assert_eq!(signaling.calls.lock().as_slice(), ["release:dlg-1"]);
        assert_eq!(manager.stats().total_terminated, 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_forces_terminating() {
        let (manager, _) = manager();
        manager.on_dialog_created("dlg-2", CallDirection::Inbound, "sip:300@pbx").unwrap();

        let err = manager
            .update_state("dlg-2", SessionState::Established)
            .await
            .unwrap_err();
        assert!(matches!(err, SoftphoneError::InvalidTransition { .. }));
        assert_eq!(manager.get("dlg-2").unwrap().state, SessionState::Terminating);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (manager, _) = manager();
        let err = manager.update_state("nope", SessionState::Connecting).await.unwrap_err();
        assert_eq!(err.category(), "session_not_found");
    }

    #[tokio::test]
    async fn test_terminate_all_picks_hangup_or_cancel() {
        let (manager, signaling) = manager();
        manager.on_dialog_created("early", CallDirection::Outbound, "a").unwrap();
        manager.on_dialog_created("live", CallDirection::Inbound, "b").unwrap();
        manager.update_state("live", SessionState::Connecting).await.unwrap();
        manager.update_state("live", SessionState::Established).await.unwrap();

        let report = manager.terminate_all("test").await;

        assert!(manager.is_empty());
        assert_eq!(report.total(), 2);
        assert!(report.forced.is_empty());
        let calls = signaling.calls.lock().clone();
        assert!(calls.contains(&"cancel:early".to_string()));
        assert!(calls.contains(&"hangup:live".to_string()));
        assert!(calls.contains(&"release:early".to_string()));
        assert!(calls.contains(&"release:live".to_string()));
    }

    #[tokio::test]
    async fn test_stats_counts_states() {
        let (manager, _) = manager();
        manager.on_dialog_created("a", CallDirection::Inbound, "x").unwrap();
        manager.on_dialog_created("b", CallDirection::Inbound, "y").unwrap();
        manager.update_state("b", SessionState::Connecting).await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.initiating, 1);
        assert_eq!(stats.connecting, 1);
        assert_eq!(stats.total_created, 2);
    }

    #[tokio::test]
    async fn test_terminate_all_waits_for_cleanup_in_flight() {
        let signaling = Arc::new(RecordingSignaling {
            release_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let manager = Arc::new(SessionManager::new(
            signaling.clone(),
            EventEmitter::new(64),
            Duration::from_millis(500),
        ));
        manager.on_dialog_created("dlg-1", CallDirection::Inbound, "sip:300@pbx").unwrap();
        manager.update_state("dlg-1", SessionState::Connecting).await.unwrap();
        manager.update_state("dlg-1", SessionState::Established).await.unwrap();
        manager.update_state("dlg-1", SessionState::Terminating).await.unwrap();

        let hangup = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.update_state("dlg-1", SessionState::Terminated).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.get("dlg-1").unwrap().state, SessionState::Terminated);

        let report = tokio::time::timeout(Duration::from_secs(2), manager.terminate_all("transport lost"))
            .await
            .expect("sweep finishes while cleanup is in flight");

        assert!(manager.is_empty());
        assert!(report.is_empty());
        hangup.await.unwrap().unwrap();
        assert_eq!(manager.stats().total_terminated, 1);
        assert_eq!(signaling.calls.lock().as_slice(), ["release:dlg-1"]);
    }

    #[tokio::test]
    async fn test_abandoned_cleanup_is_reaped_after_bound() {
        let signaling = Arc::new(RecordingSignaling {
            release_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let manager = Arc::new(SessionManager::new(
            signaling,
            EventEmitter::new(64),
            Duration::from_millis(100),
        ));
        manager.on_dialog_created("dlg-1", CallDirection::Outbound, "sip:200@pbx").unwrap();
        manager.update_state("dlg-1", SessionState::Terminating).await.unwrap();

        // The cleanup task is dropped mid-release, leaving the session behind
        let abandoned = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.update_state("dlg-1", SessionState::Terminated).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();
        assert_eq!(manager.get("dlg-1").unwrap().state, SessionState::Terminated);

        let report = tokio::time::timeout(Duration::from_secs(2), manager.terminate_all("transport lost"))
            .await
            .expect("sweep gives up waiting");

        assert!(manager.is_empty());
        assert_eq!(report.forced, ["dlg-1".to_string()]);
        assert_eq!(manager.stats().total_terminated, 1);
    }
}
