//! Directive execution engine
//!
//! Tool handlers hand the engine a declarative [`Directive`]; the
//! [`SandboxExecutor`] validates it, schedules its operations under bounded
//! concurrency, resolves each one against the [`OperationCache`] or a live
//! source and composes the final [`ExecutionResult`].
//!
//! Process-wide state (cache, capability registry, collaborators) lives in
//! an [`EngineContext`] built once by the host and shared by `Arc`.
//!
//! [`Directive`]: directive_protocol::Directive
//! [`ExecutionResult`]: directive_protocol::ExecutionResult

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod cache;
pub mod capabilities;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod research;
pub mod retry;
pub mod tasks;

pub use cache::{CacheEntryInfo, CacheStats, OperationCache, cache_key};
pub use capabilities::{
    CapabilityProbe, CapabilityRegistry, CapabilitySnapshot, CapabilitySpec, DetectionMethod,
    ProbeOutcome, ProbeRunner, ProcessProbeRunner,
};
pub use collaborators::{
    CompletionClient, GraphEdge, GraphFilter, GraphNode, GraphQueryResult, KnowledgeGraph,
    SearchResult, WebSearchClient,
};
pub use config::{EngineConfig, ExecutionLimits, RefreshMode};
pub use errors::{EngineError, ErrorCategory, Result};
pub use executor::{HandlerContext, OperationHandler, SandboxExecutor};
pub use graph::KnowledgeGraphSnapshot;
pub use research::project_files::{FsProjectScanner, ProjectScanner};
pub use research::{
    ResearchAnswer, ResearchCascade, ResearchFinding, ResearchQuestion, ResearchSource,
    WebSearchMode,
};
pub use tasks::{InMemoryTaskTracker, TaskError, TaskRecord, TaskState, TaskTracker};

use std::sync::Arc;

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state for every execution.
pub struct EngineContext {
    pub config: EngineConfig,
    pub cache: OperationCache,
    pub registry: Arc<CapabilityRegistry>,
    pub scanner: Arc<dyn ProjectScanner>,
    pub graph: Option<Arc<dyn KnowledgeGraph>>,
    pub web_search: Option<Arc<dyn WebSearchClient>>,
    /// Fallback completion; unused unless `fallback.enabled`
    pub completion: Option<Arc<dyn CompletionClient>>,
    pub tasks: Arc<dyn TaskTracker>,
}

impl EngineContext {
    /// Context with real probes, the filesystem scanner and no optional
    /// collaborators.
    pub fn new(config: EngineConfig) -> Self {
        let cache = OperationCache::new(&config.cache);
        let registry = Arc::new(CapabilityRegistry::with_process_runner(&config.capabilities));
        tracing::info!(
            version = VERSION,
            cache_entries = config.cache.max_entries,
            refresh = ?config.capabilities.refresh,
            "directive engine context initialized"
        );
        let tasks = Arc::new(InMemoryTaskTracker::from_config(&config.tasks));
        Self {
            config,
            cache,
            registry,
            scanner: Arc::new(FsProjectScanner),
            graph: None,
            web_search: None,
            completion: None,
            tasks,
        }
    }

    pub fn with_graph(mut self, graph: Arc<dyn KnowledgeGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_web_search(mut self, client: Arc<dyn WebSearchClient>) -> Self {
        self.web_search = Some(client);
        self
    }

    pub fn with_completion(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.completion = Some(client);
        self
    }

    pub fn with_task_tracker(mut self, tracker: Arc<dyn TaskTracker>) -> Self {
        self.tasks = tracker;
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn ProjectScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Replace the registry with one driven by `runner`.
    pub fn with_probe_runner(mut self, runner: Arc<dyn ProbeRunner>) -> Self {
        self.registry = Arc::new(CapabilityRegistry::new(&self.config.capabilities, runner));
        self
    }

    pub fn with_registry(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Cascade wired to this context's collaborators.
    pub fn research_cascade(&self) -> ResearchCascade {
        ResearchCascade::new(
            Arc::clone(&self.scanner),
            Arc::clone(&self.registry),
            self.config.research.clone(),
            self.config.scan.clone(),
        )
        .with_graph(self.graph.clone())
        .with_web_search(self.web_search.clone())
    }
}
