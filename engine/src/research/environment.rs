//! Environment tier (research tier 3): live capability probes.

use super::catalog::QuestionProfile;
use super::{ResearchFinding, ResearchSource};
use crate::capabilities::CapabilityRegistry;
use crate::errors::Result;

pub const AVAILABLE_WITH_VERSION: f64 = 0.85;
pub const AVAILABLE_WITHOUT_VERSION: f64 = 0.7;
pub const INFERRED_CONFIG: f64 = 0.5;
pub const UNAVAILABLE: f64 = 0.0;

pub async fn consult(registry: &CapabilityRegistry, profile: &QuestionProfile) -> Result<Vec<ResearchFinding>> {
    let mut findings = Vec::new();
    for name in profile.capabilities() {
        let probe = registry.probe(name).await?;
        let finding = match (probe.available, probe.version.as_deref()) {
            (true, Some(version)) => ResearchFinding::new(
                ResearchSource::Environment,
                format!("{name} {version} is installed"),
                AVAILABLE_WITH_VERSION,
            ),
            (true, None) => ResearchFinding::new(
                ResearchSource::Environment,
                format!("{name} is installed (version unknown)"),
                AVAILABLE_WITHOUT_VERSION,
            ),
            (false, _) => match registry.config_signal(name) {
                Some(path) => ResearchFinding::new(
                    ResearchSource::Environment,
                    format!("{name} is not on PATH but configuration exists at {}", path.display()),
                    INFERRED_CONFIG,
                )
                .with_reference(path.display().to_string()),
                None => ResearchFinding::new(
                    ResearchSource::Environment,
                    format!("{name} is not available ({:?})", probe.detection_method),
                    UNAVAILABLE,
                ),
            },
        };
        findings.push(finding.with_reference_if_absent(probe.command));
    }
    if findings.is_empty() {
        tracing::debug!("no capabilities relevant to the question");
    }
    Ok(findings)
}
