//! Scheduling loop for one directive execution.
//!
//! Eligible operations start in declared order, at most
//! `max_concurrent_ops` at a time. The loop stops on the first of:
//! everything finished, a required operation failed, the caller cancelled,
//! the wall-clock deadline passed, or a new store key would exceed
//! `max_memory_entries`.

use super::compose::{compose, fallback_prompt};
use super::dispatch::{self, DispatchOutcome, DispatchRequest};
use super::handlers::{HandlerContext, HandlerTable};
use crate::EngineContext;
use crate::config::ExecutionLimits;
use directive_async_utils::OrCancelExt;
use directive_protocol::{
    Directive, DirectiveFailure, DirectiveId, ErrorKind, ExecutionPlan, ExecutionResult,
    ExecutionStatus, FallbackOutput, OperationError, OperationResult, OperationTrace, TraceStatus,
    resolve_args,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
enum Stop {
    Cancelled,
    Deadline,
    MemoryLimit { key: String },
    Aborted { index: usize, error: OperationError },
}

enum Event {
    Cancelled,
    Deadline,
    Finished(Option<DispatchOutcome>),
}

pub(crate) struct Run<'a> {
    ctx: &'a Arc<EngineContext>,
    handlers: &'a HandlerTable,
    id: &'a DirectiveId,
    directive: &'a Directive,
    plan: &'a ExecutionPlan,
    limits: ExecutionLimits,
    cancel: &'a CancellationToken,
    started: Instant,
    /// Unfinished prerequisites per operation
    waiting: Vec<usize>,
    ready: BTreeSet<usize>,
    in_flight: BTreeSet<usize>,
    /// Store keys held in memory or claimed by a running operation
    reserved: HashSet<String>,
    memory: BTreeMap<String, OperationResult>,
    trace: Vec<OperationTrace>,
    finished: usize,
    stop: Option<Stop>,
    task_id: Option<String>,
}

impl<'a> Run<'a> {
    pub(crate) fn new(
        ctx: &'a Arc<EngineContext>,
        handlers: &'a HandlerTable,
        id: &'a DirectiveId,
        directive: &'a Directive,
        plan: &'a ExecutionPlan,
        limits: ExecutionLimits,
        cancel: &'a CancellationToken,
    ) -> Self {
        let waiting: Vec<usize> = plan.nodes.iter().map(|n| n.prerequisites.len()).collect();
        let ready = plan
            .roots()
            .into_iter()
            .filter(|&index| Some(index) != plan.compose)
            .collect();
        Self {
            ctx,
            handlers,
            id,
            directive,
            plan,
            limits,
            cancel,
            started: Instant::now(),
            waiting,
            ready,
            in_flight: BTreeSet::new(),
            reserved: HashSet::new(),
            memory: BTreeMap::new(),
            trace: initial_trace(directive),
            finished: 0,
            stop: None,
            task_id: None,
        }
    }

    pub(crate) async fn execute(mut self) -> ExecutionResult {
        tracing::info!(
            directive_id = %self.id,
            tool = %self.directive.tool,
            operations = self.directive.operations.len(),
            "directive started"
        );
        self.ctx.registry.begin_directive();
        self.open_task().await;
        self.drive().await;

        // Stops retries and further cascade tiers; running handler calls
        // finish on their own and still fill the cache.
        if self.stop.is_some() {
            self.cancel.cancel();
        }
        for index in std::mem::take(&mut self.in_flight) {
            self.trace[index].status = TraceStatus::Discarded;
        }

        let output = compose(&self.plan.compose_keys, &self.memory);
        if self.stop.is_none()
            && let Some(index) = self.plan.compose
        {
            self.store_composed(index, &output);
        }

        let (status, failure) = self.outcome();
        let mut warnings = self.plan.warnings.clone();
        let fallback = match &failure {
            Some(failure) if status == ExecutionStatus::Failed => {
                self.fallback(failure, &mut warnings).await
            }
            _ => None,
        };
        self.close_task(status, failure.as_ref()).await;

        let elapsed_ms = self.elapsed_ms();
        let cache = self.ctx.cache.stats().await;
        tracing::info!(
            directive_id = %self.id,
            status = ?status,
            elapsed_ms,
            stored = self.memory.len(),
            cache_hit_rate = cache.hit_rate(),
            "directive finished"
        );

        ExecutionResult {
            directive_id: self.id.clone(),
            tool: self.directive.tool.clone(),
            status,
            output,
            memory: self.memory,
            trace: self.trace,
            warnings,
            failure,
            fallback,
            task_id: self.task_id,
            elapsed_ms,
        }
    }

    async fn drive(&mut self) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let deadline = tokio::time::Instant::now() + self.limits.directive_timeout();
        let workers = self.limits.max_concurrent_ops.max(1);
        let cancel = self.cancel;

        loop {
            if cancel.is_cancelled() {
                self.stop = Some(Stop::Cancelled);
            }
            while self.stop.is_none()
                && self.in_flight.len() < workers
                && let Some(index) = self.ready.pop_first()
            {
                self.launch(index, &tx).await;
            }
            if self.stop.is_some() || self.in_flight.is_empty() {
                break;
            }

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Event::Deadline,
                outcome = rx.recv() => Event::Finished(outcome),
            };
            match event {
                Event::Cancelled => self.stop = Some(Stop::Cancelled),
                Event::Deadline => self.stop = Some(Stop::Deadline),
                Event::Finished(Some(outcome)) => self.record(outcome).await,
                Event::Finished(None) => break,
            }
        }
    }

    async fn launch(&mut self, index: usize, tx: &mpsc::UnboundedSender<DispatchOutcome>) {
        let directive = self.directive;
        let op = &directive.operations[index];

        if !self.reserved.contains(&op.store) && self.reserved.len() >= self.limits.max_memory_entries {
            tracing::warn!(
                directive_id = %self.id,
                store = %op.store,
                limit = self.limits.max_memory_entries,
                "memory entry limit reached"
            );
            self.stop = Some(Stop::MemoryLimit {
                key: op.store.clone(),
            });
            return;
        }
        self.reserved.insert(op.store.clone());
        let at = self.elapsed_ms();
        self.trace[index].started_at_ms = Some(at);

        let memory = &self.memory;
        let resolved = resolve_args(&op.args, &op.depends_on, |key| {
            memory.get(key).and_then(OperationResult::ok_value)
        });
        let args = match resolved {
            Ok(args) => args,
            Err(err) => {
                self.record(DispatchOutcome {
                    index,
                    result: Err(OperationError::source_unavailable(err.to_string())),
                    cache_hit: false,
                    attempts: 0,
                    duration_ms: 0,
                })
                .await;
                return;
            }
        };

        tracing::debug!(
            directive_id = %self.id,
            store = %op.store,
            op = %op.op,
            index,
            "operation started"
        );
        self.in_flight.insert(index);
        dispatch::spawn(
            DispatchRequest {
                index,
                op: op.op,
                args,
                timeout: self.limits.operation_timeout(op.timeout_ms),
                retryable: op.retryable,
            },
            self.handlers.get(op.op),
            HandlerContext {
                engine: Arc::clone(self.ctx),
                directive_id: self.id.clone(),
                store: op.store.clone(),
                cancel: self.cancel.clone(),
            },
            self.ctx.config.retry.clone(),
            tx.clone(),
        );
    }

    async fn record(&mut self, outcome: DispatchOutcome) {
        let directive = self.directive;
        let index = outcome.index;
        let op = &directive.operations[index];
        self.in_flight.remove(&index);
        self.finished += 1;

        let trace = &mut self.trace[index];
        trace.finished_at_ms = Some(self.started.elapsed().as_millis() as u64);
        trace.attempts = outcome.attempts;

        match outcome.result {
            Ok(value) => {
                trace.status = if outcome.cache_hit {
                    TraceStatus::CacheHit
                } else {
                    TraceStatus::Succeeded
                };
                tracing::debug!(
                    directive_id = %self.id,
                    store = %op.store,
                    cache_hit = outcome.cache_hit,
                    duration_ms = outcome.duration_ms,
                    "operation succeeded"
                );
                self.memory.insert(
                    op.store.clone(),
                    OperationResult::success(value, outcome.duration_ms, outcome.cache_hit),
                );
            }
            Err(error) => {
                trace.status = TraceStatus::Failed;
                trace.error = Some(error.kind);
                tracing::warn!(
                    directive_id = %self.id,
                    store = %op.store,
                    op = %op.op,
                    optional = op.optional,
                    kind = error.kind.as_str(),
                    "operation failed: {}",
                    error.message
                );
                self.memory.insert(
                    op.store.clone(),
                    OperationResult::placeholder(error.clone(), outcome.duration_ms),
                );
                if !op.optional {
                    self.stop = Some(Stop::Aborted { index, error });
                    return;
                }
            }
        }

        self.release(index);
        self.report_progress(&op.store).await;
    }

    /// Mark `index` finished for its dependents.
    fn release(&mut self, index: usize) {
        for &dependent in &self.plan.nodes[index].dependents {
            if Some(dependent) == self.plan.compose {
                continue;
            }
            let waiting = &mut self.waiting[dependent];
            *waiting = waiting.saturating_sub(1);
            if *waiting == 0 {
                self.ready.insert(dependent);
            }
        }
    }

    fn store_composed(&mut self, index: usize, output: &directive_protocol::ComposedOutput) {
        let at = self.elapsed_ms();
        let trace = &mut self.trace[index];
        trace.status = TraceStatus::Succeeded;
        trace.started_at_ms = Some(at);
        trace.finished_at_ms = Some(at);
        trace.attempts = 1;
        let value = match serde_json::to_value(output) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode composed output");
                Value::Null
            }
        };
        self.memory.insert(
            self.directive.operations[index].store.clone(),
            OperationResult::success(value, 0, false),
        );
    }

    fn outcome(&self) -> (ExecutionStatus, Option<DirectiveFailure>) {
        let partial = Some(self.id);
        match &self.stop {
            None => (ExecutionStatus::Completed, None),
            Some(Stop::Cancelled) => (
                ExecutionStatus::Cancelled,
                Some(DirectiveFailure::new(
                    ErrorKind::Cancelled,
                    "directive cancelled by caller",
                    partial,
                )),
            ),
            Some(Stop::Deadline) => (
                ExecutionStatus::Failed,
                Some(DirectiveFailure::new(
                    ErrorKind::ResourceExhausted,
                    format!(
                        "directive exceeded its {}ms time limit",
                        self.limits.directive_timeout_ms
                    ),
                    partial,
                )),
            ),
            Some(Stop::MemoryLimit { key }) => (
                ExecutionStatus::Failed,
                Some(DirectiveFailure::new(
                    ErrorKind::ResourceExhausted,
                    format!(
                        "storing '{key}' would exceed the limit of {} memory entries",
                        self.limits.max_memory_entries
                    ),
                    partial,
                )),
            ),
            Some(Stop::Aborted { index, error }) => {
                let op = &self.directive.operations[*index];
                (
                    ExecutionStatus::Failed,
                    Some(DirectiveFailure::new(
                        error.kind,
                        format!("operation '{}' ({}) failed: {}", op.store, op.op, error.message),
                        partial,
                    )),
                )
            }
        }
    }

    async fn fallback(
        &self,
        failure: &DirectiveFailure,
        warnings: &mut Vec<String>,
    ) -> Option<FallbackOutput> {
        let config = &self.ctx.config.fallback;
        if !config.enabled {
            return None;
        }
        let client = self.ctx.completion.as_ref()?;

        let never_ran: Vec<String> = self
            .trace
            .iter()
            .filter(|t| {
                matches!(t.status, TraceStatus::NotStarted | TraceStatus::Discarded)
                    && Some(t.index) != self.plan.compose
            })
            .map(|t| t.store.clone())
            .collect();
        let prompt = fallback_prompt(&self.directive.tool, &failure.message, &self.memory, &never_ran);

        let result = client
            .complete(&prompt)
            .within(Duration::from_millis(config.timeout_ms))
            .await;
        match result {
            Ok(Ok(text)) => {
                tracing::info!(directive_id = %self.id, "fallback completion produced output");
                Some(FallbackOutput::new(text))
            }
            Ok(Err(e)) => {
                warnings.push(format!("fallback completion failed: {e}"));
                None
            }
            Err(e) => {
                warnings.push(format!("fallback completion failed: {e}"));
                None
            }
        }
    }

    async fn open_task(&mut self) {
        if self.directive.operations.len() < self.ctx.config.tasks.min_operations {
            return;
        }
        match self.ctx.tasks.create_task(self.id).await {
            Ok(task_id) => self.task_id = Some(task_id),
            Err(e) => tracing::warn!(directive_id = %self.id, error = %e, "could not register task"),
        }
    }

    async fn report_progress(&self, store: &str) {
        let Some(task_id) = self.task_id.as_deref() else {
            return;
        };
        let total = self
            .directive
            .operations
            .len()
            .saturating_sub(usize::from(self.plan.compose.is_some()))
            .max(1);
        let percent = (self.finished * 100 / total).min(99) as u8;
        if let Err(e) = self.ctx.tasks.update_progress(task_id, percent, Some(store)).await {
            tracing::debug!(task_id, error = %e, "progress update rejected");
        }
    }

    async fn close_task(&self, status: ExecutionStatus, failure: Option<&DirectiveFailure>) {
        let Some(task_id) = self.task_id.as_deref() else {
            return;
        };
        let result = match status {
            ExecutionStatus::Completed => self.ctx.tasks.complete_task(task_id, None).await,
            ExecutionStatus::Cancelled => self.ctx.tasks.cancel_task(task_id).await.map(|_| ()),
            ExecutionStatus::Failed | ExecutionStatus::Rejected => {
                let reason = failure.map_or("directive failed", |f| f.message.as_str());
                self.ctx.tasks.fail_task(task_id, reason).await
            }
        };
        if let Err(e) = result {
            tracing::warn!(task_id, error = %e, "task state update failed");
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Every operation `NotStarted`, in declared order.
pub(crate) fn initial_trace(directive: &Directive) -> Vec<OperationTrace> {
    directive
        .operations
        .iter()
        .enumerate()
        .map(|(index, op)| OperationTrace {
            index,
            store: op.store.clone(),
            op: op.op,
            status: TraceStatus::NotStarted,
            started_at_ms: None,
            finished_at_ms: None,
            attempts: 0,
            error: None,
        })
        .collect()
}
