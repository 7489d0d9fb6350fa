//! Exponential backoff with jitter for retryable operations.
//!
//! Only errors classified as retryable are retried (for operations that is
//! `OperationTimeout`); everything else returns after the first attempt.
//! Backoff sleeps are cancellable through the directive's token.

use crate::config::RetryConfig;
use directive_async_utils::sleep_or_cancel;
use directive_protocol::{ErrorKind, OperationError};
use rand::Rng;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Error classification for retry decisions
pub trait RetryClassifiable {
    fn is_retryable(&self) -> bool;
}

impl RetryClassifiable for OperationError {
    fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::OperationTimeout
    }
}

/// Reported before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryStatus {
    /// Attempt that just failed (1-indexed)
    pub attempt: u32,
    pub elapsed: Duration,
    pub sleep: Duration,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Not retryable; returned after the attempt that produced it
    Permanent(E),
    /// Still failing after every allowed retry
    Exhausted(E),
    /// Cancelled before or between attempts
    Aborted,
}

impl<E> RetryError<E> {
    /// The underlying error, if an attempt produced one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Permanent(e) | Self::Exhausted(e) => Some(e),
            Self::Aborted => None,
        }
    }
}

/// Outcome plus how many attempts were made.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, RetryError<E>>,
    pub attempts: u32,
}

/// Run `operation`, retrying retryable failures up to
/// `config.max_attempts` extra times.
///
/// `max_attempts = 2` means one initial call plus at most two retries.
pub async fn retry_with_backoff<F, Fut, T, E, S>(
    mut operation: F,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut status_cb: S,
) -> Attempted<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: RetryClassifiable + std::fmt::Display,
    S: FnMut(RetryStatus),
{
    let start = Instant::now();
    let mut attempt: u32 = 0;
    let mut backoff_ms = config.initial_backoff_ms;

    loop {
        if cancel.is_cancelled() {
            return Attempted {
                result: Err(RetryError::Aborted),
                attempts: attempt,
            };
        }

        attempt = attempt.saturating_add(1);
        let err = match operation(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Attempted {
                result: Err(RetryError::Permanent(err)),
                attempts: attempt,
            };
        }
        if attempt > config.max_attempts {
            return Attempted {
                result: Err(RetryError::Exhausted(err)),
                attempts: attempt,
            };
        }

        let sleep = apply_jitter(
            Duration::from_millis(backoff_ms.min(config.max_backoff_ms)),
            config.jitter_factor,
        );
        status_cb(RetryStatus {
            attempt,
            elapsed: start.elapsed(),
            sleep,
            reason: format!("{err}, retrying in {sleep:?}"),
        });

        if sleep_or_cancel(sleep, cancel).await.is_err() {
            return Attempted {
                result: Err(RetryError::Aborted),
                attempts: attempt,
            };
        }

        backoff_ms = (backoff_ms as f64 * config.backoff_multiplier) as u64;
    }
}

/// Apply ±`jitter_factor` random variation to `duration`.
///
/// Example: 100ms with 0.2 jitter -> 80ms to 120ms
pub fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor.is_nan() || jitter_factor <= 0.0 {
        return duration;
    }
    let factor = jitter_factor.min(1.0);
    let jitter = rand::rng().random_range(-factor..=factor);
    let jittered_ms = (duration.as_millis() as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(jittered_ms)
}
