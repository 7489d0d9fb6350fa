//! Knowledge graph snapshot
//!
//! Read-only [`KnowledgeGraph`] over a JSON file of `{ nodes, edges }`
//! written by the host's graph store. Loaded once; queries never touch disk.

use crate::collaborators::{GraphEdge, GraphFilter, GraphNode, GraphQueryResult, KnowledgeGraph};
use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraphSnapshot {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

impl KnowledgeGraphSnapshot {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self { nodes, edges }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::graph_with_source(
                format!("failed to read graph snapshot {}", path.display()),
                e,
            )
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let parsed: GraphQueryResult = serde_json::from_str(raw)
            .map_err(|e| EngineError::graph_with_source("failed to parse graph snapshot", e))?;
        tracing::debug!(
            nodes = parsed.nodes.len(),
            edges = parsed.edges.len(),
            "knowledge graph snapshot loaded"
        );
        Ok(Self::new(parsed.nodes, parsed.edges))
    }
}

#[async_trait]
impl KnowledgeGraph for KnowledgeGraphSnapshot {
    async fn query_graph(&self, filter: &GraphFilter) -> Result<GraphQueryResult> {
        let terms: Vec<String> = filter.terms.iter().map(|t| t.to_lowercase()).collect();

        let mut nodes: Vec<GraphNode> = self
            .nodes
            .iter()
            .filter(|n| filter.node_types.is_empty() || filter.node_types.contains(&n.node_type))
            .filter(|n| {
                let text = n.searchable_text();
                terms.is_empty() || terms.iter().any(|t| text.contains(t.as_str()))
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            nodes.truncate(limit);
        }

        let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let edges = self
            .edges
            .iter()
            .filter(|e| ids.contains(e.from.as_str()) && ids.contains(e.to.as_str()))
            .cloned()
            .collect();

        Ok(GraphQueryResult { nodes, edges })
    }
}
