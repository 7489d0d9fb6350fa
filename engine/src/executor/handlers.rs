//! Operation handlers
//!
//! One handler per [`OperationKind`]. Arguments arrive already resolved and
//! are decoded into typed structs here; a decode failure is
//! `InvalidArguments`, never a panic. Handlers do not touch the cache or
//! SessionMemory; the dispatcher owns both.

use crate::EngineContext;
use crate::collaborators::GraphFilter;
use crate::research::ResearchQuestion;
use crate::research::project_files::ScanProfile;
use async_trait::async_trait;
use directive_protocol::{DirectiveId, OperationError, OperationKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a handler may reach during one call.
#[derive(Clone)]
pub struct HandlerContext {
    pub engine: Arc<EngineContext>,
    pub directive_id: DirectiveId,
    pub store: String,
    /// Fires when the directive stops; check it at suspension points
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, args: &Value) -> Result<Value, OperationError>;
}

/// Handler per operation kind. `composeResult` is executed by the
/// scheduler itself and never has an entry.
#[derive(Clone)]
pub struct HandlerTable {
    handlers: BTreeMap<OperationKind, Arc<dyn OperationHandler>>,
}

impl HandlerTable {
    pub fn builtin() -> Self {
        let handlers = OperationKind::ALL
            .iter()
            .filter_map(|kind| builtin_handler(*kind).map(|h| (*kind, h)))
            .collect();
        Self { handlers }
    }

    pub fn get(&self, kind: OperationKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Replace the handler for `kind`. Returns `false` for `composeResult`.
    pub fn set(&mut self, kind: OperationKind, handler: Arc<dyn OperationHandler>) -> bool {
        if kind == OperationKind::ComposeResult {
            return false;
        }
        self.handlers.insert(kind, handler);
        true
    }
}

fn builtin_handler(kind: OperationKind) -> Option<Arc<dyn OperationHandler>> {
    match kind {
        OperationKind::AnswerResearchQuestion => Some(Arc::new(ResearchHandler)),
        OperationKind::ScanProjectFiles => Some(Arc::new(ScanHandler)),
        OperationKind::QueryKnowledgeGraph => Some(Arc::new(GraphQueryHandler)),
        OperationKind::ProbeCapability => Some(Arc::new(ProbeHandler)),
        OperationKind::ListCapabilities => Some(Arc::new(ListCapabilitiesHandler)),
        OperationKind::ReadFile => Some(Arc::new(ReadFileHandler)),
        OperationKind::WebSearch => Some(Arc::new(WebSearchHandler)),
        OperationKind::ComposeResult => None,
    }
}

fn decode<T: DeserializeOwned>(args: &Value) -> Result<T, OperationError> {
    serde_json::from_value(args.clone()).map_err(|e| OperationError::invalid_arguments(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, OperationError> {
    serde_json::to_value(value)
        .map_err(|e| OperationError::source_unavailable(format!("failed to encode result: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Research
// ─────────────────────────────────────────────────────────────────────────────

struct ResearchHandler;

#[async_trait]
impl OperationHandler for ResearchHandler {
    async fn handle(&self, ctx: &HandlerContext, args: &Value) -> Result<Value, OperationError> {
        let question =
            ResearchQuestion::from_args(args, ctx.engine.config.research.confidence_threshold)?;
        let answer = ctx
            .engine
            .research_cascade()
            .answer(&question, &ctx.cancel)
            .await
            .map_err(|e| e.to_operation_error())?;
        encode(&answer)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanArgs {
    project_path: PathBuf,
    #[serde(default)]
    terms: Vec<String>,
    #[serde(default)]
    technologies: Vec<String>,
}

struct ScanHandler;

#[async_trait]
impl OperationHandler for ScanHandler {
    async fn handle(&self, ctx: &HandlerContext, args: &Value) -> Result<Value, OperationError> {
        let args: ScanArgs = decode(args)?;
        let profile = ScanProfile {
            terms: args.terms.iter().map(|t| t.to_lowercase()).collect(),
            technologies: args.technologies,
            limits: ctx.engine.config.scan.clone(),
        };
        let scan = ctx
            .engine
            .scanner
            .scan(&args.project_path, &profile)
            .await
            .map_err(|e| e.to_operation_error())?;
        encode(&scan)
    }
}

struct GraphQueryHandler;

#[async_trait]
impl OperationHandler for GraphQueryHandler {
    async fn handle(&self, ctx: &HandlerContext, args: &Value) -> Result<Value, OperationError> {
        let mut filter: GraphFilter = decode(args)?;
        filter.terms = filter.terms.iter().map(|t| t.to_lowercase()).collect();
        let Some(graph) = ctx.engine.graph.as_ref() else {
            return Err(OperationError::source_unavailable("no knowledge graph configured"));
        };
        let result = graph
            .query_graph(&filter)
            .await
            .map_err(|e| e.to_operation_error())?;
        encode(&result)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProbeArgs {
    name: String,
}

struct ProbeHandler;

#[async_trait]
impl OperationHandler for ProbeHandler {
    async fn handle(&self, ctx: &HandlerContext, args: &Value) -> Result<Value, OperationError> {
        let args: ProbeArgs = decode(args)?;
        if args.name.trim().is_empty() {
            return Err(OperationError::invalid_arguments("capability name is empty"));
        }
        let probe = ctx
            .engine
            .registry
            .probe(&args.name)
            .await
            .map_err(|e| e.to_operation_error())?;
        encode(&probe)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListArgs {
    /// Probe the whole catalogue before answering
    #[serde(default)]
    probe: bool,
}

struct ListCapabilitiesHandler;

#[async_trait]
impl OperationHandler for ListCapabilitiesHandler {
    async fn handle(&self, ctx: &HandlerContext, args: &Value) -> Result<Value, OperationError> {
        let args: ListArgs = decode(args)?;
        let registry = &ctx.engine.registry;
        let snapshot = if args.probe {
            registry.probe_all().await
        } else {
            registry.snapshot().await
        };
        Ok(json!({
            "known": encode(&registry.list_known())?,
            "snapshot": encode(&*snapshot)?,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Files
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadFileArgs {
    project_path: PathBuf,
    path: String,
    #[serde(default)]
    max_bytes: Option<u64>,
}

struct ReadFileHandler;

#[async_trait]
impl OperationHandler for ReadFileHandler {
    async fn handle(&self, ctx: &HandlerContext, args: &Value) -> Result<Value, OperationError> {
        let args: ReadFileArgs = decode(args)?;
        let rel = Path::new(&args.path);
        if !is_confined(rel) {
            return Err(OperationError::invalid_arguments(format!(
                "path '{}' must be relative and stay inside projectPath",
                args.path
            )));
        }

        let root = tokio::fs::canonicalize(&args.project_path).await.map_err(|e| {
            OperationError::source_unavailable(format!(
                "project path {}: {e}",
                args.project_path.display()
            ))
        })?;
        let full = tokio::fs::canonicalize(root.join(rel))
            .await
            .map_err(|e| OperationError::source_unavailable(format!("{}: {e}", args.path)))?;
        // Symlinks may still point outside the root.
        if !full.starts_with(&root) {
            return Err(OperationError::invalid_arguments(format!(
                "path '{}' resolves outside projectPath",
                args.path
            )));
        }

        let limit = args.max_bytes.unwrap_or(ctx.engine.config.scan.max_file_bytes);
        let bytes = tokio::fs::read(&full)
            .await
            .map_err(|e| OperationError::source_unavailable(format!("{}: {e}", args.path)))?;
        let total = bytes.len() as u64;
        let truncated = total > limit;
        let kept = if truncated {
            &bytes[..usize::try_from(limit).unwrap_or(usize::MAX).min(bytes.len())]
        } else {
            &bytes[..]
        };

        Ok(json!({
            "path": args.path,
            "content": String::from_utf8_lossy(kept),
            "bytes": total,
            "truncated": truncated,
        }))
    }
}

/// Relative, with no `..`, root or prefix components.
fn is_confined(rel: &Path) -> bool {
    !rel.as_os_str().is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

// ─────────────────────────────────────────────────────────────────────────────
// Web search
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WebSearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

struct WebSearchHandler;

#[async_trait]
impl OperationHandler for WebSearchHandler {
    async fn handle(&self, ctx: &HandlerContext, args: &Value) -> Result<Value, OperationError> {
        let args: WebSearchArgs = decode(args)?;
        let Some(client) = ctx.engine.web_search.as_ref() else {
            return Err(OperationError::source_unavailable("no web search client configured"));
        };
        let limit = args.limit.unwrap_or(ctx.engine.config.research.web_search_limit);
        let results = client
            .search(&args.query, limit)
            .await
            .map_err(|e| e.to_operation_error())?;
        encode(&results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use directive_protocol::ErrorKind;
    use pretty_assertions::assert_eq;

    fn context() -> HandlerContext {
        HandlerContext {
            engine: Arc::new(EngineContext::new(EngineConfig::default())),
            directive_id: DirectiveId::from("dir-test"),
            store: "file".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn table_covers_every_kind_but_compose() {
        let table = HandlerTable::builtin();

        for kind in OperationKind::ALL {
            assert_eq!(table.get(kind).is_some(), kind != OperationKind::ComposeResult);
        }
    }

    #[test]
    fn confinement_rejects_escapes() {
        assert!(is_confined(Path::new("src/main.rs")));
        assert!(is_confined(Path::new("./README.md")));
        assert!(!is_confined(Path::new("../secrets")));
        assert!(!is_confined(Path::new("a/../../b")));
        assert!(!is_confined(Path::new("/etc/passwd")));
        assert!(!is_confined(Path::new("")));
    }

    #[tokio::test]
    async fn read_file_stays_inside_project() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("notes.txt"), "hello world").expect("write");
        let ctx = context();

        let value = ReadFileHandler
            .handle(
                &ctx,
                &json!({ "projectPath": dir.path(), "path": "notes.txt", "maxBytes": 5 }),
            )
            .await
            .expect("read");
        assert_eq!(value["content"], "hello");
        assert_eq!(value["truncated"], true);

        let err = ReadFileHandler
            .handle(&ctx, &json!({ "projectPath": dir.path(), "path": "../notes.txt" }))
            .await
            .expect_err("escape");
        assert_eq!(err.kind, ErrorKind::InvalidArguments);

        let err = ReadFileHandler
            .handle(&ctx, &json!({ "projectPath": dir.path(), "path": "absent.txt" }))
            .await
            .expect_err("missing");
        assert_eq!(err.kind, ErrorKind::SourceUnavailable);
    }

    #[tokio::test]
    async fn bad_arguments_are_invalid_not_fatal() {
        let err = ProbeHandler
            .handle(&context(), &json!({ "name": 42 }))
            .await
            .expect_err("decode");

        assert_eq!(err.kind, ErrorKind::InvalidArguments);
    }

    #[tokio::test]
    async fn probe_outside_the_catalogue_is_invalid() {
        let ctx = context();

        let err = ProbeHandler
            .handle(&ctx, &json!({ "name": "shutdown" }))
            .await
            .expect_err("not catalogued");

        assert_eq!(err.kind, ErrorKind::InvalidArguments);
        assert!(err.message.contains("shutdown"));
        assert!(ctx.engine.registry.snapshot().await.probes.is_empty());
    }

    #[tokio::test]
    async fn missing_collaborators_are_source_unavailable() {
        let ctx = context();

        let graph = GraphQueryHandler
            .handle(&ctx, &json!({ "terms": ["kubernetes"] }))
            .await
            .expect_err("no graph");
        let web = WebSearchHandler
            .handle(&ctx, &json!({ "query": "kubernetes" }))
            .await
            .expect_err("no client");

        assert_eq!(graph.kind, ErrorKind::SourceUnavailable);
        assert_eq!(web.kind, ErrorKind::SourceUnavailable);
    }
}
