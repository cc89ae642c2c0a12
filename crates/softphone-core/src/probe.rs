//! Agent status probe boundary
//!
//! After a reconnect the core asks an external service whether this device
//! is logged in as a call-center agent. The answer only changes the wording
//! of the notification shown to the user; it never touches registration.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProbeError;

/// Answer of the agent status service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    LoggedIn { agent_number: String },
    NotLoggedIn,
}

/// Result of one bounded probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    LoggedIn { agent_number: String },
    NotLoggedIn,
    Unavailable { error: ProbeError },
}

/// External agent status service
#[async_trait]
pub trait AgentStatusProbe: Send + Sync {
    async fn query(&self, device_id: &str) -> Result<AgentStatus, ProbeError>;
}

/// Query `probe` under its own timeout; failures become `Unavailable`
pub async fn probe_with_timeout(
    probe: &dyn AgentStatusProbe,
    device_id: &str,
    timeout: Duration,
) -> ProbeOutcome {
    let result = match tokio::time::timeout(timeout, probe.query(device_id)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout {
            duration_ms: timeout.as_millis() as u64,
        }),
    };

    match result {
        Ok(AgentStatus::LoggedIn { agent_number }) => {
            debug!(device_id = device_id, agent_number = %agent_number, "agent logged in");
            ProbeOutcome::LoggedIn { agent_number }
        }
        Ok(AgentStatus::NotLoggedIn) => {
            debug!(device_id = device_id, "agent not logged in");
            ProbeOutcome::NotLoggedIn
        }
        Err(error) => {
            warn!(device_id = device_id, error = %error, "agent status unavailable");
            ProbeOutcome::Unavailable { error }
        }
    }
}
