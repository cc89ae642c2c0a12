//! Persisted connection state
//!
//! A single durable record remembers whether the last session of this
//! profile ended connected, so a page reload can restore the connection.
//! The record is:
//!
//! - read once at startup by the reconnect orchestrator,
//! - written when registration succeeds,
//! - cleared on an intentional disconnect or when found stale.
//!
//! Writers in other tabs or processes are not coordinated: the last writer
//! wins.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{SoftphoneError, SoftphoneResult};

/// The persisted outcome of the last connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConnectionState {
    pub was_connected: bool,
    pub config_snapshot: ConnectionConfig,
    pub saved_at_epoch_ms: i64,
}

impl PersistedConnectionState {
    /// Record of a live, registered connection saved at `now_ms`
    pub fn connected(config: ConnectionConfig, now_ms: i64) -> Self {
        Self {
            was_connected: true,
            config_snapshot: config,
            saved_at_epoch_ms: now_ms,
        }
    }

    /// Age of the record; a timestamp from the future counts as zero
    pub fn age_ms(&self, now_ms: i64) -> u64 {
        now_ms.saturating_sub(self.saved_at_epoch_ms).max(0) as u64
    }

    /// Valid only while `now - savedAt <= stale_after_ms`
    pub fn is_stale(&self, now_ms: i64, stale_after_ms: u64) -> bool {
        self.age_ms(now_ms) > stale_after_ms
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Key-value home of the persisted connection record
///
/// Each call is a single atomic operation on the backing storage.
#[async_trait]
pub trait ConnectionStateStore: Send + Sync {
    async fn get(&self) -> SoftphoneResult<Option<PersistedConnectionState>>;

    async fn set(&self, state: PersistedConnectionState) -> SoftphoneResult<()>;

    async fn clear(&self) -> SoftphoneResult<()>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<Option<PersistedConnectionState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a record, as if left behind by a previous page
    pub fn with_state(state: PersistedConnectionState) -> Self {
        Self {
            state: RwLock::new(Some(state)),
        }
    }
}

#[async_trait]
impl ConnectionStateStore for MemoryStateStore {
    async fn get(&self) -> SoftphoneResult<Option<PersistedConnectionState>> {
        Ok(self.state.read().clone())
    }

    async fn set(&self, state: PersistedConnectionState) -> SoftphoneResult<()> {
        *self.state.write() = Some(state);
        Ok(())
    }

    async fn clear(&self) -> SoftphoneResult<()> {
        *self.state.write() = None;
        Ok(())
    }
}

/// Store backed by a JSON document on disk
///
/// Writes go to a sibling temporary file which is then renamed over the
/// record, so readers see either the old or the new document.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "connection-state".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ConnectionStateStore for FileStateStore {
    async fn get(&self) -> SoftphoneResult<Option<PersistedConnectionState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SoftphoneError::state_store(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable connection state");
                Ok(None)
            }
        }
    }

    async fn set(&self, state: PersistedConnectionState) -> SoftphoneResult<()> {
        let json = serde_json::to_vec_pretty(&state)
            .map_err(|e| SoftphoneError::state_store(format!("failed to encode state: {}", e)))?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, &json)
            .await
            .map_err(|e| SoftphoneError::state_store(format!("failed to write {}: {}", temp.display(), e)))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| SoftphoneError::state_store(format!("failed to replace {}: {}", self.path.display(), e)))?;

        debug!(path = %self.path.display(), "connection state saved");
        Ok(())
    }

    async fn clear(&self) -> SoftphoneResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "connection state cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SoftphoneError::state_store(format!(
                "failed to remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ConnectionConfig {
        ConnectionConfig::new("wss://pbx.example.com/ws", "1001").with_credential("pw")
    }

    #[test]
    fn test_staleness_boundary() {
        let state = PersistedConnectionState::connected(sample_config(), 1_000_000);
        assert!(!state.is_stale(1_000_000 + 300_000, 300_000));
        assert!(state.is_stale(1_000_000 + 300_001, 300_000));
    }

    #[test]
    fn test_future_timestamp_counts_as_fresh() {
        let state = PersistedConnectionState::connected(sample_config(), 2_000_000);
        assert_eq!(state.age_ms(1_000_000), 0);
        assert!(!state.is_stale(1_000_000, 300_000));
    }

    #[tokio::test]
    async fn test_memory_store_set_get_clear() {
        let store = MemoryStateStore::new();
        assert!(store.get().await.unwrap().is_none());

        let state = PersistedConnectionState::connected(sample_config(), now_epoch_ms());
        store.set(state.clone()).await.unwrap();
        assert_eq!(store.get().await.unwrap(), Some(state));

        store.clear().await.unwrap();
        assert!(store.get().await.unwrap().is_none());
        // Clearing twice is harmless
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connection.json");

        let state = PersistedConnectionState::connected(sample_config(), 1_700_000_000_000);
        FileStateStore::new(&path).set(state.clone()).await.unwrap();

        // A fresh instance models the page after a reload
        let reloaded = FileStateStore::new(&path);
        assert_eq!(reloaded.get().await.unwrap(), Some(state));
        assert!(!dir.path().join("connection.json.tmp").exists());

        reloaded.clear().await.unwrap();
        assert!(reloaded.get().await.unwrap().is_none());
        reloaded.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_corrupt_document_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connection.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = FileStateStore::new(&path);
        assert!(store.get().await.unwrap().is_none());
    }

    #[test]
    fn test_persisted_json_uses_camel_case() {
        let state = PersistedConnectionState::connected(sample_config(), 42);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["wasConnected"], true);
        assert_eq!(json["savedAtEpochMs"], 42);
        assert_eq!(json["configSnapshot"]["username"], "1001");
    }
}
