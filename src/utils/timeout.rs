//! Timeout defaults and async timeout helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

/// Bound on a single transport write
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on each handshake step
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Silence tolerated on an inbound chunked transfer before asking for missing chunks
pub const CHUNK_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for start-ack / end-ack on an outbound chunked transfer
pub const CHUNK_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a request's response
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `future` with a deadline, mapping expiry to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_ms = duration.as_millis() as u64, "operation timed out");
            Err(ProtocolError::Timeout)
        }
    }
}
