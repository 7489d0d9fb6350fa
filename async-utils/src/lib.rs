//! Cancellation-aware async helpers shared by the directive engine.
//!
//! Two kinds of bound exist. A `CancellationToken` gates work that has not
//! started yet (retry backoff, cascade tiers); a deadline bounds work that
//! is already running. Running work is never dropped because a token fired.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Error returned when a future is cancelled.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelErr {
    Cancelled,
}

/// A deadline elapsed before the future produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineElapsed(pub Duration);

impl std::fmt::Display for DeadlineElapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timed out after {}ms", self.0.as_millis())
    }
}

impl std::error::Error for DeadlineElapsed {}

/// Extension trait for racing futures against a `CancellationToken` or a
/// deadline.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Returns `Ok(output)` if the future completes first, or
    /// `Err(CancelErr::Cancelled)` if the token is cancelled.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;

    /// Run to completion or until `limit` elapses, whichever comes first.
    async fn within(self, limit: Duration) -> Result<Self::Output, DeadlineElapsed>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            res = self => Ok(res),
        }
    }

    async fn within(self, limit: Duration) -> Result<Self::Output, DeadlineElapsed> {
        tokio::time::timeout(limit, self)
            .await
            .map_err(|_| DeadlineElapsed(limit))
    }
}

/// Sleep for `duration` unless the token fires first.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> Result<(), CancelErr> {
    if duration.is_zero() {
        return if token.is_cancelled() {
            Err(CancelErr::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::time::sleep(duration).or_cancel(token).await
}
