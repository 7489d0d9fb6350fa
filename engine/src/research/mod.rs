//! Research cascade
//!
//! Answers a question by consulting sources in a fixed priority order:
//! project files, the knowledge graph, live environment probes and, only
//! when explicitly forced, web search. The cascade stops at the first tier
//! after which the aggregate confidence reaches the question's threshold.
//!
//! Every tier call is time-bounded. A tier that cannot run contributes a
//! zero-confidence finding carrying the error kind and the cascade moves on.
//! Cancellation is honoured between tiers; a tier already running finishes.

pub mod catalog;
pub mod environment;
pub mod knowledge_graph;
pub mod project_files;
pub mod synthesis;
pub mod web_search;

use crate::capabilities::CapabilityRegistry;
use crate::collaborators::{KnowledgeGraph, WebSearchClient};
use crate::config::{ResearchConfig, ScanConfig};
use crate::errors::{EngineError, Result};
use catalog::QuestionProfile;
use chrono::{DateTime, Utc};
use directive_async_utils::OrCancelExt;
use directive_protocol::{ErrorKind, OperationError};
use project_files::{ProjectScanner, ScanProfile};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebSearchMode {
    /// Recommend web search when local tiers fall short, never run it
    #[default]
    Recommend,
    /// Run web search if the local tiers fall short
    Force,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchQuestion {
    pub text: String,
    pub project_path: PathBuf,
    pub confidence_threshold: f64,
    #[serde(default)]
    pub web_search: WebSearchMode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuestionArgs {
    question: String,
    project_path: PathBuf,
    #[serde(default)]
    confidence_threshold: Option<f64>,
    #[serde(default)]
    web_search: WebSearchMode,
}

impl ResearchQuestion {
    pub fn new(text: impl Into<String>, project_path: impl Into<PathBuf>, threshold: f64) -> Self {
        Self {
            text: text.into(),
            project_path: project_path.into(),
            confidence_threshold: threshold,
            web_search: WebSearchMode::Recommend,
        }
    }

    pub fn force_web_search(mut self) -> Self {
        self.web_search = WebSearchMode::Force;
        self
    }

    /// Decode `answerResearchQuestion` arguments.
    pub fn from_args(args: &Value, default_threshold: f64) -> std::result::Result<Self, OperationError> {
        let parsed: QuestionArgs = serde_json::from_value(args.clone())
            .map_err(|e| OperationError::invalid_arguments(e.to_string()))?;
        let threshold = parsed.confidence_threshold.unwrap_or(default_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(OperationError::invalid_arguments(format!(
                "confidenceThreshold must be within 0..=1, got {threshold}"
            )));
        }
        if parsed.question.trim().is_empty() {
            return Err(OperationError::invalid_arguments("question is empty"));
        }
        Ok(Self {
            text: parsed.question,
            project_path: parsed.project_path,
            confidence_threshold: threshold,
            web_search: parsed.web_search,
        })
    }
}

/// Tiers in consultation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchSource {
    ProjectFiles,
    KnowledgeGraph,
    Environment,
    WebSearch,
}

impl ResearchSource {
    pub const ORDER: [ResearchSource; 4] = [
        Self::ProjectFiles,
        Self::KnowledgeGraph,
        Self::Environment,
        Self::WebSearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectFiles => "project_files",
            Self::KnowledgeGraph => "knowledge_graph",
            Self::Environment => "environment",
            Self::WebSearch => "web_search",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchFinding {
    pub source: ResearchSource,
    pub content: String,
    pub confidence: f64,
    pub consulted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl ResearchFinding {
    pub fn new(source: ResearchSource, content: impl Into<String>, confidence: f64) -> Self {
        Self {
            source,
            content: content.into(),
            confidence: confidence.clamp(0.0, 1.0),
            consulted_at: Utc::now(),
            reference: None,
            error: None,
        }
    }

    /// Zero-confidence record of a tier that could not be consulted.
    pub fn failed(source: ResearchSource, error: &EngineError) -> Self {
        Self {
            error: Some(error.kind()),
            ..Self::new(source, error.to_string(), 0.0)
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_reference_if_absent(mut self, reference: impl Into<String>) -> Self {
        if self.reference.is_none() {
            self.reference = Some(reference.into());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchAnswer {
    pub question: String,
    /// Every finding in consultation order, low-confidence ones included
    pub findings: Vec<ResearchFinding>,
    pub aggregate_confidence: f64,
    pub confidence_threshold: f64,
    pub threshold_met: bool,
    /// Prefix of the tier order, ending at the tier that met the threshold
    pub tiers_consulted: Vec<ResearchSource>,
    pub web_search_invoked: bool,
    pub recommended_web_search: bool,
    pub synthesized_answer: String,
}

/// Aggregate confidence of a set of findings: the single strongest one.
pub fn aggregate_confidence(findings: &[ResearchFinding]) -> f64 {
    findings
        .iter()
        .map(|f| f.confidence)
        .fold(0.0, f64::max)
}

pub struct ResearchCascade {
    scanner: Arc<dyn ProjectScanner>,
    graph: Option<Arc<dyn KnowledgeGraph>>,
    registry: Arc<CapabilityRegistry>,
    web: Option<Arc<dyn WebSearchClient>>,
    config: ResearchConfig,
    scan: ScanConfig,
}

impl ResearchCascade {
    pub fn new(
        scanner: Arc<dyn ProjectScanner>,
        registry: Arc<CapabilityRegistry>,
        config: ResearchConfig,
        scan: ScanConfig,
    ) -> Self {
        Self {
            scanner,
            graph: None,
            registry,
            web: None,
            config,
            scan,
        }
    }

    pub fn with_graph(mut self, graph: Option<Arc<dyn KnowledgeGraph>>) -> Self {
        self.graph = graph;
        self
    }

    pub fn with_web_search(mut self, web: Option<Arc<dyn WebSearchClient>>) -> Self {
        self.web = web;
        self
    }

    /// Run the cascade. `cancel` is checked before each tier; tier failures
    /// that [`ErrorCategory::cascade_recoverable`] accepts become findings,
    /// anything else ends the run.
    ///
    /// [`ErrorCategory::cascade_recoverable`]: crate::errors::ErrorCategory::cascade_recoverable
    pub async fn answer(
        &self,
        question: &ResearchQuestion,
        cancel: &CancellationToken,
    ) -> Result<ResearchAnswer> {
        let profile = QuestionProfile::from_question(&question.text);
        let threshold = question.confidence_threshold;
        let mut findings: Vec<ResearchFinding> = Vec::new();
        let mut tiers_consulted = Vec::new();
        let mut web_search_invoked = false;
        let mut recommended_web_search = false;

        for tier in ResearchSource::ORDER {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            tiers_consulted.push(tier);

            let outcome = match tier {
                ResearchSource::WebSearch => match (&self.web, question.web_search) {
                    (Some(client), WebSearchMode::Force) => {
                        web_search_invoked = true;
                        self.bounded(web_search::consult(
                            client.as_ref(),
                            &question.text,
                            &profile,
                            self.config.web_search_limit,
                        ))
                        .await
                    }
                    (None, WebSearchMode::Force) => {
                        recommended_web_search = true;
                        let mut finding = ResearchFinding::new(
                            tier,
                            "web search forced but no client is configured",
                            0.0,
                        );
                        finding.error = Some(ErrorKind::SourceUnavailable);
                        Ok(vec![finding])
                    }
                    (_, WebSearchMode::Recommend) => {
                        recommended_web_search = true;
                        Ok(Vec::new())
                    }
                },
                ResearchSource::ProjectFiles => {
                    let scan_profile = ScanProfile::for_question(&profile, self.scan.clone());
                    self.bounded(async {
                        let scan = self.scanner.scan(&question.project_path, &scan_profile).await?;
                        Ok(project_files::findings_from_scan(&scan, &profile))
                    })
                    .await
                }
                ResearchSource::KnowledgeGraph => match &self.graph {
                    Some(graph) => {
                        self.bounded(knowledge_graph::consult(
                            graph.as_ref(),
                            &profile,
                            self.config.graph_limit,
                            Utc::now(),
                        ))
                        .await
                    }
                    None => Err(EngineError::graph("no knowledge graph configured")),
                },
                ResearchSource::Environment => {
                    self.bounded(environment::consult(&self.registry, &profile)).await
                }
            };

            match outcome {
                Ok(found) => findings.extend(found),
                Err(err) if !err.category().cascade_recoverable() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        tier = tier.as_str(),
                        category = err.category().as_str(),
                        error = %err,
                        "research tier unavailable"
                    );
                    findings.push(ResearchFinding::failed(tier, &err));
                }
            }

            let aggregate = aggregate_confidence(&findings);
            tracing::debug!(tier = tier.as_str(), confidence = aggregate, "research tier consulted");
            if aggregate >= threshold {
                break;
            }
        }

        let aggregate = aggregate_confidence(&findings);
        let synthesized_answer = synthesis::synthesize(
            &question.text,
            &findings,
            aggregate,
            threshold,
            recommended_web_search,
        );
        tracing::info!(
            confidence = aggregate,
            threshold,
            tiers = tiers_consulted.len(),
            web_search_invoked,
            "research question answered"
        );

        Ok(ResearchAnswer {
            question: question.text.clone(),
            findings,
            aggregate_confidence: aggregate,
            confidence_threshold: threshold,
            threshold_met: aggregate >= threshold,
            tiers_consulted,
            web_search_invoked,
            recommended_web_search,
            synthesized_answer,
        })
    }

    async fn bounded<F>(&self, tier: F) -> Result<Vec<ResearchFinding>>
    where
        F: std::future::Future<Output = Result<Vec<ResearchFinding>>> + Send,
    {
        tier.within(self.config.tier_timeout()).await?
    }
}
