//! Sandbox executor
//!
//! Validates a directive, runs its operations against the shared
//! [`EngineContext`] under the caller's [`ExecutionLimits`] and returns an
//! [`ExecutionResult`]. Every call gets its own SessionMemory; the cache and
//! capability registry are shared across calls.
//!
//! Running directives can be cancelled by id from any task.

pub mod compose;
mod dispatch;
pub mod handlers;
mod run;

pub use handlers::{HandlerContext, HandlerTable, OperationHandler};

use crate::EngineContext;
use crate::config::ExecutionLimits;
use directive_protocol::{
    ComposedOutput, Directive, DirectiveFailure, DirectiveId, ErrorKind, ExecutionPlan,
    ExecutionResult, ExecutionStatus, OperationKind, ValidationError,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

type RunningMap = Arc<Mutex<HashMap<DirectiveId, CancellationToken>>>;

pub struct SandboxExecutor {
    ctx: Arc<EngineContext>,
    handlers: HandlerTable,
    running: RunningMap,
}

impl SandboxExecutor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            handlers: HandlerTable::builtin(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the built-in handler for `kind`.
    pub fn with_handler(mut self, kind: OperationKind, handler: Arc<dyn OperationHandler>) -> Self {
        if !self.handlers.set(kind, handler) {
            tracing::warn!(op = %kind, "composeResult has no handler; ignoring override");
        }
        self
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Validate without running anything.
    pub fn validate(&self, directive: &Directive) -> Result<ExecutionPlan, ValidationError> {
        directive_protocol::validate(directive)
    }

    pub async fn execute(&self, directive: &Directive, limits: ExecutionLimits) -> ExecutionResult {
        self.execute_with_id(DirectiveId::new(), directive, limits).await
    }

    /// Execute under a caller-chosen id so the caller can cancel it.
    pub async fn execute_with_id(
        &self,
        id: DirectiveId,
        directive: &Directive,
        limits: ExecutionLimits,
    ) -> ExecutionResult {
        let started = Instant::now();
        let plan = match self.validate(directive) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(directive_id = %id, tool = %directive.tool, error = %err, "directive rejected");
                return rejected(id, directive, err.to_string(), started);
            }
        };
        for warning in &plan.warnings {
            tracing::warn!(directive_id = %id, "{warning}");
        }

        let token = CancellationToken::new();
        let Some(_guard) = RunningGuard::register(&self.running, &id, &token) else {
            return rejected(
                id.clone(),
                directive,
                format!("directive id '{id}' is already running"),
                started,
            );
        };

        run::Run::new(&self.ctx, &self.handlers, &id, directive, &plan, limits, &token)
            .execute()
            .await
    }

    /// Cancel a running directive. Returns `false` when no directive with
    /// that id is running.
    pub fn cancel(&self, id: &DirectiveId) -> bool {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get(id) {
            Some(token) => {
                tracing::info!(directive_id = %id, "directive cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of directives currently executing.
    pub fn running(&self) -> Vec<DirectiveId> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<DirectiveId> = running.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Removes the directive from the running map when execution ends or the
/// execution future is dropped.
struct RunningGuard {
    running: RunningMap,
    id: DirectiveId,
}

impl RunningGuard {
    fn register(running: &RunningMap, id: &DirectiveId, token: &CancellationToken) -> Option<Self> {
        let mut map = running.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(id) {
            return None;
        }
        map.insert(id.clone(), token.clone());
        Some(Self {
            running: Arc::clone(running),
            id: id.clone(),
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut map = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = map.remove(&self.id) {
            // Reaches operations still in flight when the caller dropped the execution.
            token.cancel();
        }
    }
}

fn rejected(
    id: DirectiveId,
    directive: &Directive,
    message: String,
    started: Instant,
) -> ExecutionResult {
    ExecutionResult {
        failure: Some(DirectiveFailure::new(ErrorKind::ValidationError, message, None)),
        directive_id: id,
        tool: directive.tool.clone(),
        status: ExecutionStatus::Rejected,
        output: ComposedOutput::default(),
        memory: BTreeMap::new(),
        trace: run::initial_trace(directive),
        warnings: Vec::new(),
        fallback: None,
        task_id: None,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
