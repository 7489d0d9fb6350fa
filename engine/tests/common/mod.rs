#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

//! Mock collaborators shared by the integration suites.

use async_trait::async_trait;
use directive_engine::{
    CompletionClient, EngineConfig, EngineContext, ExecutionLimits, GraphFilter, GraphQueryResult,
    HandlerContext, KnowledgeGraph, OperationHandler, ProbeOutcome, ProbeRunner, SearchResult,
    WebSearchClient,
};
use directive_protocol::OperationError;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn limits() -> ExecutionLimits {
    ExecutionLimits {
        directive_timeout_ms: 5_000,
        max_concurrent_ops: 4,
        max_memory_entries: 64,
        default_operation_timeout_ms: 2_000,
    }
}

/// Config with fast retries so tests don't wait on backoff.
pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.initial_backoff_ms = 5;
    config.retry.max_backoff_ms = 20;
    config
}

// ─────────────────────────────────────────────────────────────────────────────
// Operation handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Echoes its arguments, recording start/end events keyed by store.
///
/// Behaviour is selected by the `name` argument: names registered with
/// `delay` sleep first, names registered with `fail` return that error.
#[derive(Default)]
pub struct RecordingHandler {
    pub calls: AtomicUsize,
    pub events: Mutex<Vec<String>>,
    delays: HashMap<String, Duration>,
    failures: HashMap<String, OperationError>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub fn fail(mut self, name: &str, error: OperationError) -> Self {
        self.failures.insert(name.to_string(), error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {event} not recorded"))
    }
}

#[async_trait]
impl OperationHandler for RecordingHandler {
    async fn handle(&self, ctx: &HandlerContext, args: &Value) -> Result<Value, OperationError> {
        let name = args["name"].as_str().unwrap_or_default().to_string();
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("start:{}", ctx.store));
        if let Some(delay) = self.delays.get(&name) {
            tokio::time::sleep(*delay).await;
        }
        self.events.lock().unwrap().push(format!("end:{}", ctx.store));
        if let Some(err) = self.failures.get(&name) {
            return Err(err.clone());
        }
        Ok(json!({ "store": ctx.store, "args": args }))
    }
}

/// Slow for the first `slow_calls` invocations, instant afterwards.
pub struct FlakyHandler {
    pub calls: AtomicUsize,
    slow_calls: usize,
    delay: Duration,
}

impl FlakyHandler {
    pub fn new(slow_calls: usize, delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            slow_calls,
            delay,
        }
    }
}

#[async_trait]
impl OperationHandler for FlakyHandler {
    async fn handle(&self, _ctx: &HandlerContext, _args: &Value) -> Result<Value, OperationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.slow_calls {
            tokio::time::sleep(self.delay).await;
        }
        Ok(json!({ "call": call + 1 }))
    }
}

/// Signals once started, then never finishes on its own.
pub struct BlockingHandler {
    pub started: Arc<Notify>,
}

#[async_trait]
impl OperationHandler for BlockingHandler {
    async fn handle(&self, _ctx: &HandlerContext, _args: &Value) -> Result<Value, OperationError> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Probe runner with a fixed set of installed tools.
pub struct ScriptedRunner {
    pub calls: AtomicUsize,
    installed: HashMap<String, String>,
}

impl ScriptedRunner {
    pub fn new(installed: &[(&str, &str)]) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            installed: installed
                .iter()
                .map(|(name, out)| (name.to_string(), out.to_string()))
                .collect(),
        }
    }

    pub fn nothing() -> Self {
        Self::new(&[])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeRunner for ScriptedRunner {
    async fn run(&self, program: &str, _args: &[String], _timeout: Duration) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.installed.get(program) {
            Some(stdout) => ProbeOutcome::Exited {
                code: 0,
                stdout: stdout.clone(),
                stderr: String::new(),
            },
            None => ProbeOutcome::NotFound,
        }
    }
}

/// Wraps a graph and counts queries.
pub struct CountingGraph {
    pub calls: AtomicUsize,
    inner: Option<Arc<dyn KnowledgeGraph>>,
}

impl CountingGraph {
    pub fn empty() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            inner: None,
        }
    }

    pub fn wrapping(inner: Arc<dyn KnowledgeGraph>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            inner: Some(inner),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KnowledgeGraph for CountingGraph {
    async fn query_graph(&self, filter: &GraphFilter) -> directive_engine::Result<GraphQueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.inner {
            Some(inner) => inner.query_graph(filter).await,
            None => Ok(GraphQueryResult::default()),
        }
    }
}

#[derive(Default)]
pub struct CountingWeb {
    pub calls: AtomicUsize,
    pub results: Vec<SearchResult>,
}

impl CountingWeb {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebSearchClient for CountingWeb {
    async fn search(&self, _query: &str, limit: usize) -> directive_engine::Result<Vec<SearchResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.results.iter().take(limit).cloned().collect())
    }
}

#[derive(Default)]
pub struct CountingCompletion {
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl CountingCompletion {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for CountingCompletion {
    async fn complete(&self, prompt: &str) -> directive_engine::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok("best-effort answer".to_string())
    }
}

/// Context whose probes never spawn processes.
pub fn context(runner: Arc<ScriptedRunner>) -> EngineContext {
    EngineContext::new(config()).with_probe_runner(runner)
}
