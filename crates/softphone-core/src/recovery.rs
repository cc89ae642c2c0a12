//! Bounded waits for lifecycle operations
//!
//! Connect, register, probe and graceful termination each run under their own
//! timer. Nothing here retries; a failed connection attempt is reported once
//! and the user reconnects manually.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{SoftphoneError, SoftphoneResult};

/// Run `future` with a time limit, mapping expiry to `OperationTimeout`
pub async fn with_timeout<T, F>(
    operation_name: &str,
    timeout: Duration,
    future: F,
) -> SoftphoneResult<T>
where
    F: Future<Output = SoftphoneResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(SoftphoneError::OperationTimeout {
                operation: operation_name.to_string(),
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}
