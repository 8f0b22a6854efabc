//! Cancellable polling helpers

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Result of a single poll: `Ok(Some(value))` when done, `Ok(None)` to retry
pub type PollResult<T> = Result<Option<T>>;

/// Sleep for `duration` unless `cancel` fires first
pub async fn sleep_or_cancel(
    cancel: &CancellationToken,
    duration: Duration,
    what: &str,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled(what)),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Poll `check_fn` every `interval` until it yields a value, fails, or `cancel` fires
///
/// There is no deadline; callers bound the wait through the token.
pub async fn poll_until<T, F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    what: &str,
    mut check_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(what));
        }
        if let Some(value) = check_fn().await? {
            return Ok(value);
        }
        debug!("waiting for {}...", what);
        sleep_or_cancel(cancel, interval, what).await?;
    }
}
