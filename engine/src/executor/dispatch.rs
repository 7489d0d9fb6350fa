//! Single-operation dispatch: cache lookup, bounded handler call with
//! retries, cache write.
//!
//! Runs on its own detached tokio task. Once started, a handler call is
//! bounded only by the operation's timeout: stopping the directive never
//! drops it. The scheduler may stop listening before the task finishes; a
//! value produced after that still lands in the cache. The directive token
//! only prevents further retry attempts.

use super::handlers::{HandlerContext, OperationHandler};
use crate::cache::cache_key;
use crate::config::RetryConfig;
use crate::retry::retry_with_backoff;
use directive_async_utils::{DeadlineElapsed, OrCancelExt};
use directive_protocol::{OperationError, OperationKind};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// One resolved operation ready to run.
pub(crate) struct DispatchRequest {
    pub index: usize,
    pub op: OperationKind,
    pub args: Value,
    pub timeout: Duration,
    pub retryable: bool,
}

/// Reported back to the scheduler.
#[derive(Debug)]
pub(crate) struct DispatchOutcome {
    pub index: usize,
    pub result: Result<Value, OperationError>,
    pub cache_hit: bool,
    pub attempts: u32,
    pub duration_ms: u64,
}

pub(crate) fn spawn(
    request: DispatchRequest,
    handler: Option<Arc<dyn OperationHandler>>,
    ctx: HandlerContext,
    retry: RetryConfig,
    tx: mpsc::UnboundedSender<DispatchOutcome>,
) {
    tokio::spawn(async move {
        let outcome = dispatch(request, handler, &ctx, &retry).await;
        if tx.send(outcome).is_err() {
            tracing::debug!(
                directive_id = %ctx.directive_id,
                store = %ctx.store,
                "result arrived after the directive stopped; discarded"
            );
        }
    });
}

async fn dispatch(
    request: DispatchRequest,
    handler: Option<Arc<dyn OperationHandler>>,
    ctx: &HandlerContext,
    retry: &RetryConfig,
) -> DispatchOutcome {
    let started = Instant::now();
    let finish = |result: Result<Value, OperationError>, cache_hit: bool, attempts: u32| DispatchOutcome {
        index: request.index,
        result,
        cache_hit,
        attempts,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    let key = request
        .op
        .is_cacheable()
        .then(|| cache_key(request.op, &request.args));
    if let Some(key) = key.as_deref()
        && let Some(value) = ctx.engine.cache.get(key).await
    {
        tracing::debug!(store = %ctx.store, op = %request.op, "cache hit");
        return finish(Ok(value), true, 0);
    }

    let Some(handler) = handler else {
        return finish(
            Err(OperationError::source_unavailable(format!(
                "no handler registered for {}",
                request.op
            ))),
            false,
            0,
        );
    };

    let retry = if request.retryable {
        retry.clone()
    } else {
        RetryConfig {
            max_attempts: 0,
            ..retry.clone()
        }
    };
    let timeout = request.timeout;
    let args = &request.args;
    let attempted = retry_with_backoff(
        |_attempt| {
            let handler = Arc::clone(&handler);
            async move {
                match handler.handle(ctx, args).within(timeout).await {
                    Ok(result) => result,
                    Err(DeadlineElapsed(limit)) => {
                        Err(OperationError::timeout(limit.as_millis() as u64))
                    }
                }
            }
        },
        &retry,
        &ctx.cancel,
        |status| {
            tracing::info!(
                directive_id = %ctx.directive_id,
                store = %ctx.store,
                attempt = status.attempt,
                "{}",
                status.reason
            );
        },
    )
    .await;

    let result = match attempted.result {
        Ok(value) => {
            if let Some(key) = key {
                ctx.engine.cache.insert(key, value.clone()).await;
            }
            Ok(value)
        }
        Err(err) => Err(err.into_inner().unwrap_or_else(OperationError::cancelled)),
    };
    finish(result, false, attempted.attempts)
}
