//! External collaborators
//!
//! The engine consults these through traits only. Hosts plug in real
//! clients; tests plug in counting mocks.

use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Knowledge graph
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only query against the recorded knowledge graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFilter {
    /// Lowercased terms matched against node labels, tags and properties
    #[serde(default)]
    pub terms: Vec<String>,
    /// Restrict to these node types (empty = any)
    #[serde(default)]
    pub node_types: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    pub label: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl GraphNode {
    /// Lowercased text searched by term filters.
    pub fn searchable_text(&self) -> String {
        let mut text = format!("{} {} {}", self.label, self.node_type, self.tags.join(" "));
        for value in self.properties.values() {
            if let Some(s) = value.as_str() {
                text.push(' ');
                text.push_str(s);
            }
        }
        text.to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub relation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQueryResult {
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    /// Nodes matching `filter` and the edges among them.
    async fn query_graph(&self, filter: &GraphFilter) -> Result<GraphQueryResult>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Web search
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[async_trait]
pub trait WebSearchClient: Send + Sync {
    /// Only called when a caller explicitly asks for web search.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// AI completion (fallback only)
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Free-text completion for `prompt`.
    ///
    /// # Returns
    /// * `Ok(text)` - completion text, tagged by the caller
    /// * `Err(EngineError::Upstream)` - the completion service failed
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_text_includes_tags_and_string_properties() {
        let node: GraphNode = serde_json::from_value(json!({
            "id": "n1",
            "type": "decision",
            "label": "Adopt Kubernetes",
            "tags": ["platform"],
            "properties": { "tool": "Helm", "replicas": 3 }
        }))
        .expect("decode");

        let text = node.searchable_text();

        assert!(text.contains("adopt kubernetes"));
        assert!(text.contains("platform"));
        assert!(text.contains("helm"));
        assert!(!text.contains('3'));
    }
}
