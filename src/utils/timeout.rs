//! Default deadlines and async timeout helpers.

use crate::error::{NetError, Result};
use std::future::Future;
use std::time::Duration;

/// Receive deadline for a single frame on a regular connection
pub const READ_TIMEOUT: Duration = Duration::from_secs(65);

/// Write deadline for a single frame
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between keepalive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Bound on graceful server shutdown before the timeout callback runs
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on dialing a remote endpoint
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive deadline for RPC client connections, which may idle for long periods
pub const RPC_READ_TIMEOUT: Duration = Duration::from_secs(3600 * 24);

/// Default deadline for an RPC call
pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` with a deadline, mapping expiry to [`NetError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, dur: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(dur, fut).await {
        Ok(res) => res,
        Err(_) => Err(NetError::Timeout),
    }
}
