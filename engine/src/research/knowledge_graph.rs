//! Knowledge graph tier (research tier 2).
//!
//! confidence = (0.3 + 0.5 * specificity) * (0.75 + 0.25 * recency)
//! specificity = share of question keywords the node matches, or 1.0 when
//!               the node names a technology the question names
//! recency     = exp(-ln(2) * age_days / 30)

use super::catalog::QuestionProfile;
use super::{ResearchFinding, ResearchSource};
use crate::collaborators::{GraphFilter, GraphNode, KnowledgeGraph};
use crate::errors::Result;
use chrono::{DateTime, Utc};

pub const RECENCY_HALF_LIFE_DAYS: f64 = 30.0;
const MAX_FINDINGS: usize = 5;

pub fn recency(updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(updated_at) = updated_at else {
        return 0.0;
    };
    let age_days = (now - updated_at).num_seconds().max(0) as f64 / 86_400.0;
    (-std::f64::consts::LN_2 * age_days / RECENCY_HALF_LIFE_DAYS).exp()
}

pub fn specificity(node: &GraphNode, profile: &QuestionProfile) -> f64 {
    let text = node.searchable_text();
    if profile.named.iter().any(|t| t.mentioned_in(&text)) {
        return 1.0;
    }
    if profile.keywords.is_empty() {
        return 0.0;
    }
    let matched = profile
        .keywords
        .iter()
        .filter(|k| text.contains(k.as_str()))
        .count();
    matched as f64 / profile.keywords.len() as f64
}

pub fn node_confidence(specificity: f64, recency: f64) -> f64 {
    (0.3 + 0.5 * specificity) * (0.75 + 0.25 * recency)
}

pub async fn consult(
    graph: &dyn KnowledgeGraph,
    profile: &QuestionProfile,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<ResearchFinding>> {
    let filter = GraphFilter {
        terms: profile.graph_terms(),
        node_types: Vec::new(),
        limit: Some(limit),
    };
    let result = graph.query_graph(&filter).await?;

    let mut findings: Vec<ResearchFinding> = result
        .nodes
        .iter()
        .filter_map(|node| {
            let spec = specificity(node, profile);
            if spec <= 0.0 {
                return None;
            }
            let confidence = node_confidence(spec, recency(node.updated_at, now));
            let kind = if node.node_type.is_empty() {
                "node"
            } else {
                node.node_type.as_str()
            };
            Some(
                ResearchFinding::new(
                    ResearchSource::KnowledgeGraph,
                    format!("Recorded {kind} '{}'", node.label),
                    confidence,
                )
                .with_reference(format!("graph:{}", node.id)),
            )
        })
        .collect();

    findings.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    findings.truncate(MAX_FINDINGS);
    Ok(findings)
}
