//! Project file scanning (research tier 1).
//!
//! Structural detection parses manifests (YAML resources, Dockerfiles,
//! compose files, Helm charts, Terraform, package manifests). Name matches
//! and loose text matches are weaker signals and scored lower.

use super::catalog::{self, QuestionProfile};
use super::{ResearchFinding, ResearchSource};
use crate::config::ScanConfig;
use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const STRUCTURAL_CONFIDENCE: f64 = 0.9;
pub const EXACT_MATCH_CONFIDENCE: f64 = 0.8;
pub const LOOSE_MATCH_CONFIDENCE: f64 = 0.35;

/// Loose matches beyond this are dropped; they add noise, not confidence.
const MAX_LOOSE_MATCHES: usize = 20;
const MAX_FINDINGS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Structural,
    ExactMatch,
    LooseMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEvidence {
    pub kind: EvidenceKind,
    /// Path relative to the project root, `/`-separated
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technology: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectScan {
    pub files_scanned: usize,
    /// Stopped early at `max_files`
    pub truncated: bool,
    pub technologies: BTreeSet<String>,
    pub evidence: Vec<ProjectEvidence>,
}

/// What to look for during one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanProfile {
    /// Lowercased terms for exact and loose matching
    pub terms: Vec<String>,
    /// Technology names whose spellings count as exact filename matches
    pub technologies: Vec<String>,
    pub limits: ScanConfig,
}

impl ScanProfile {
    pub fn for_question(profile: &QuestionProfile, limits: ScanConfig) -> Self {
        Self {
            terms: profile.keywords.clone(),
            technologies: profile.relevant.iter().map(|t| t.name.to_string()).collect(),
            limits,
        }
    }
}

#[async_trait]
pub trait ProjectScanner: Send + Sync {
    async fn scan(&self, project_path: &Path, profile: &ScanProfile) -> Result<ProjectScan>;
}

/// Walks the real filesystem on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProjectScanner;

#[async_trait]
impl ProjectScanner for FsProjectScanner {
    async fn scan(&self, project_path: &Path, profile: &ScanProfile) -> Result<ProjectScan> {
        let root = project_path.to_path_buf();
        let profile = profile.clone();
        tokio::task::spawn_blocking(move || scan_blocking(&root, &profile))
            .await
            .map_err(|e| EngineError::internal(format!("scan task failed: {e}")))?
    }
}

fn scan_blocking(root: &Path, profile: &ScanProfile) -> Result<ProjectScan> {
    let meta = std::fs::metadata(root).map_err(|e| {
        EngineError::scan_with_source(format!("project path {}", root.display()), e)
    })?;
    if !meta.is_dir() {
        return Err(EngineError::scan(format!(
            "project path {} is not a directory",
            root.display()
        )));
    }

    let limits = &profile.limits;
    let mut scan = ProjectScan::default();
    let mut loose = 0usize;

    let walker = WalkDir::new(root)
        .max_depth(limits.max_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !limits
                    .ignore
                    .iter()
                    .any(|i| e.file_name().to_str() == Some(i.as_str()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if scan.files_scanned >= limits.max_files {
            scan.truncated = true;
            break;
        }
        scan.files_scanned += 1;

        let rel = relative_path(root, entry.path());
        let file_name = entry.file_name().to_string_lossy().to_string();
        let small = entry
            .metadata()
            .map(|m| m.len() <= limits.max_file_bytes)
            .unwrap_or(false);
        let contents = if small {
            std::fs::read_to_string(entry.path()).ok()
        } else {
            None
        };

        let structural = detect_structural(&rel, &file_name, contents.as_deref());
        let had_structural = !structural.is_empty();
        for (technology, detail) in structural {
            scan.technologies.insert(technology.to_string());
            scan.evidence.push(ProjectEvidence {
                kind: EvidenceKind::Structural,
                path: rel.clone(),
                technology: Some(technology.to_string()),
                detail,
            });
        }
        if had_structural {
            continue;
        }

        if let Some((technology, detail)) = exact_match(&file_name, profile) {
            scan.evidence.push(ProjectEvidence {
                kind: EvidenceKind::ExactMatch,
                path: rel,
                technology,
                detail,
            });
            continue;
        }

        if loose < MAX_LOOSE_MATCHES
            && let Some(text) = contents.as_deref()
            && let Some(term) = loose_match(text, &profile.terms)
        {
            loose += 1;
            scan.evidence.push(ProjectEvidence {
                kind: EvidenceKind::LooseMatch,
                path: rel,
                technology: None,
                detail: format!("mentions '{term}'"),
            });
        }
    }

    tracing::debug!(
        root = %root.display(),
        files = scan.files_scanned,
        evidence = scan.evidence.len(),
        truncated = scan.truncated,
        "project scan finished"
    );
    Ok(scan)
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Technologies a file proves by its structure.
pub fn detect_structural(
    rel_path: &str,
    file_name: &str,
    contents: Option<&str>,
) -> Vec<(&'static str, String)> {
    let lower = file_name.to_lowercase();
    let mut found: Vec<(&'static str, String)> = Vec::new();

    if lower == "dockerfile" || lower.starts_with("dockerfile.") || lower.ends_with(".dockerfile") {
        found.push(("docker", "Dockerfile".to_string()));
    }
    if matches!(
        lower.as_str(),
        "docker-compose.yml" | "docker-compose.yaml" | "compose.yml" | "compose.yaml"
    ) {
        found.push(("docker", "compose file".to_string()));
        return found;
    }
    if lower == "chart.yaml" {
        found.push(("helm", "Helm chart".to_string()));
        return found;
    }
    if lower.ends_with(".tf") || lower.ends_with(".tf.json") {
        found.push(("terraform", "Terraform configuration".to_string()));
    }
    if lower == "pulumi.yaml" || lower == "pulumi.yml" {
        found.push(("pulumi", "Pulumi project".to_string()));
        return found;
    }
    if lower == "ansible.cfg" {
        found.push(("ansible", "Ansible configuration".to_string()));
    }
    let manifest = match lower.as_str() {
        "package.json" => Some(("node", "npm package manifest")),
        "requirements.txt" | "pyproject.toml" | "setup.py" => Some(("python", "Python package manifest")),
        "cargo.toml" => Some(("rust", "Cargo manifest")),
        "go.mod" => Some(("go", "Go module")),
        _ => None,
    };
    if let Some((tech, detail)) = manifest {
        found.push((tech, detail.to_string()));
    }

    if (lower.ends_with(".yaml") || lower.ends_with(".yml"))
        && let Some(text) = contents
    {
        found.extend(detect_yaml(rel_path, text));
    }
    found
}

/// Kubernetes/OpenShift resources and Ansible playbooks in YAML documents.
fn detect_yaml(rel_path: &str, text: &str) -> Vec<(&'static str, String)> {
    let mut kinds: Vec<(&'static str, String)> = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let Ok(value) = serde_yaml::Value::deserialize(document) else {
            // Templated YAML (Helm) rarely parses; not structural evidence.
            return kinds;
        };
        if let Some(kind) = resource_kind(&value) {
            let api = value
                .get("apiVersion")
                .and_then(serde_yaml::Value::as_str)
                .unwrap_or_default();
            let tech = if api.contains("openshift.io") || matches!(kind, "Route" | "DeploymentConfig") {
                "openshift"
            } else {
                "kubernetes"
            };
            let detail = format!("{} manifest ({kind})", capitalize(tech));
            if !kinds.iter().any(|(_, d)| *d == detail) {
                kinds.push((tech, detail));
            }
        } else if is_playbook(&value) && !kinds.iter().any(|(t, _)| *t == "ansible") {
            kinds.push(("ansible", format!("Ansible playbook {rel_path}")));
        }
    }
    kinds
}

fn resource_kind(value: &serde_yaml::Value) -> Option<&str> {
    value.get("apiVersion").and_then(serde_yaml::Value::as_str)?;
    value.get("kind").and_then(serde_yaml::Value::as_str)
}

fn is_playbook(value: &serde_yaml::Value) -> bool {
    value.as_sequence().is_some_and(|plays| {
        !plays.is_empty()
            && plays
                .iter()
                .all(|p| p.get("hosts").is_some() && (p.get("tasks").is_some() || p.get("roles").is_some()))
    })
}

fn capitalize(s: &str) -> String {
    match s {
        "kubernetes" => "Kubernetes".to_string(),
        "openshift" => "OpenShift".to_string(),
        other => other.to_string(),
    }
}

fn exact_match(file_name: &str, profile: &ScanProfile) -> Option<(Option<String>, String)> {
    let lower = file_name.to_lowercase();
    for name in &profile.technologies {
        if let Some(tech) = catalog::find(name)
            && tech.mentioned_in(&lower)
        {
            return Some((Some(tech.name.to_string()), format!("file name names {}", tech.name)));
        }
    }
    let stem = lower.split('.').next().unwrap_or_default();
    profile
        .terms
        .iter()
        .find(|t| t.len() >= 3 && stem == t.as_str())
        .map(|t| (None, format!("file name matches '{t}'")))
}

fn loose_match<'t>(text: &str, terms: &'t [String]) -> Option<&'t str> {
    let lower = text.to_lowercase();
    terms
        .iter()
        .filter(|t| t.len() >= 3)
        .find(|t| lower.contains(t.as_str()))
        .map(String::as_str)
}

/// Score scan evidence against a question.
///
/// Structural evidence for a technology the question is not about counts
/// only as a loose signal.
pub fn findings_from_scan(scan: &ProjectScan, profile: &QuestionProfile) -> Vec<ResearchFinding> {
    let mut findings: Vec<ResearchFinding> = scan
        .evidence
        .iter()
        .map(|ev| {
            let relevant = ev
                .technology
                .as_deref()
                .is_some_and(|t| profile.is_relevant(t));
            let confidence = match ev.kind {
                EvidenceKind::Structural if relevant => STRUCTURAL_CONFIDENCE,
                EvidenceKind::ExactMatch => EXACT_MATCH_CONFIDENCE,
                EvidenceKind::Structural | EvidenceKind::LooseMatch => LOOSE_MATCH_CONFIDENCE,
            };
            ResearchFinding::new(
                ResearchSource::ProjectFiles,
                format!("{} found at {}", ev.detail, ev.path),
                confidence,
            )
            .with_reference(ev.path.clone())
        })
        .collect();

    findings.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    findings.truncate(MAX_FINDINGS);
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: api\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: api\n";

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, contents).expect("write");
    }

    #[test]
    fn detects_kubernetes_resources_in_multi_document_yaml() {
        let found = detect_structural("k8s/deploy.yaml", "deploy.yaml", Some(DEPLOYMENT));

        assert_eq!(
            found,
            vec![
                ("kubernetes", "Kubernetes manifest (Deployment)".to_string()),
                ("kubernetes", "Kubernetes manifest (Service)".to_string()),
            ]
        );
    }

    #[test]
    fn detects_manifest_files_by_name() {
        assert_eq!(detect_structural("Dockerfile", "Dockerfile", None)[0].0, "docker");
        assert_eq!(detect_structural("infra/main.tf", "main.tf", None)[0].0, "terraform");
        assert_eq!(detect_structural("chart/Chart.yaml", "Chart.yaml", None)[0].0, "helm");
        assert!(detect_structural("notes.yaml", "notes.yaml", Some("a: [unclosed")).is_empty());
    }

    #[tokio::test]
    async fn scan_collects_structural_exact_and_loose_evidence() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "k8s/deploy.yaml", DEPLOYMENT);
        write(dir.path(), "docs/kubernetes-notes.md", "cluster notes");
        write(dir.path(), "README.md", "We run on Kubernetes in prod.");
        write(dir.path(), "node_modules/pkg/deploy.yaml", DEPLOYMENT);

        let question = QuestionProfile::from_question("Does this project deploy to Kubernetes?");
        let profile = ScanProfile::for_question(&question, ScanConfig::default());
        let scan = FsProjectScanner.scan(dir.path(), &profile).await.expect("scan");

        assert_eq!(scan.files_scanned, 3);
        assert!(scan.technologies.contains("kubernetes"));
        let kinds: BTreeSet<(EvidenceKind, &str)> = scan
            .evidence
            .iter()
            .map(|e| (e.kind, e.path.as_str()))
            .collect();
        assert!(kinds.contains(&(EvidenceKind::Structural, "k8s/deploy.yaml")));
        assert!(kinds.contains(&(EvidenceKind::ExactMatch, "docs/kubernetes-notes.md")));
        assert!(kinds.contains(&(EvidenceKind::LooseMatch, "README.md")));

        let findings = findings_from_scan(&scan, &question);
        assert_eq!(findings[0].confidence, STRUCTURAL_CONFIDENCE);
        assert_eq!(findings[0].reference.as_deref(), Some("k8s/deploy.yaml"));
    }

    #[tokio::test]
    async fn unrelated_structural_evidence_scores_low() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "package.json", "{}");

        let question = QuestionProfile::from_question("Does this project use Terraform?");
        let scan = FsProjectScanner
            .scan(dir.path(), &ScanProfile::for_question(&question, ScanConfig::default()))
            .await
            .expect("scan");

        let findings = findings_from_scan(&scan, &question);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].confidence, LOOSE_MATCH_CONFIDENCE);
    }

    #[tokio::test]
    async fn missing_project_path_is_a_scan_error() {
        let dir = tempfile::tempdir().expect("tempdir");

        let err = FsProjectScanner
            .scan(&dir.path().join("absent"), &ScanProfile::default())
            .await
            .expect_err("missing");

        assert_eq!(err.category(), crate::errors::ErrorCategory::ScanError);
    }

    #[tokio::test]
    async fn max_files_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..5 {
            write(dir.path(), &format!("f{i}.txt"), "x");
        }
        let limits = ScanConfig {
            max_files: 2,
            ..ScanConfig::default()
        };

        let scan = FsProjectScanner
            .scan(
                dir.path(),
                &ScanProfile {
                    limits,
                    ..ScanProfile::default()
                },
            )
            .await
            .expect("scan");

        assert_eq!(scan.files_scanned, 2);
        assert!(scan.truncated);
    }
}
