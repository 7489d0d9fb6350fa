//! Answer synthesis from the strongest findings.

use super::ResearchFinding;

const TIE_EPSILON: f64 = 1e-9;

/// Findings sharing the top confidence, in recorded order.
pub fn strongest(findings: &[ResearchFinding]) -> Vec<&ResearchFinding> {
    let best = super::aggregate_confidence(findings);
    if best <= 0.0 {
        return Vec::new();
    }
    findings
        .iter()
        .filter(|f| (f.confidence - best).abs() < TIE_EPSILON)
        .collect()
}

pub fn synthesize(
    question: &str,
    findings: &[ResearchFinding],
    aggregate: f64,
    threshold: f64,
    web_search_recommended: bool,
) -> String {
    let top = strongest(findings);
    if top.is_empty() {
        let mut text = format!("No evidence found for \"{question}\".");
        text.push_str(&remediation(web_search_recommended));
        return text;
    }

    let evidence = top
        .iter()
        .map(|f| format!("{} [{}]", f.content, f.source.as_str()))
        .collect::<Vec<_>>()
        .join("; ");

    if aggregate >= threshold {
        format!("{evidence} (confidence {aggregate:.2})")
    } else {
        let mut text = format!(
            "Low confidence ({aggregate:.2} < threshold {threshold:.2}). Best available evidence: {evidence}."
        );
        text.push_str(&remediation(web_search_recommended));
        text
    }
}

fn remediation(web_search_recommended: bool) -> String {
    if web_search_recommended {
        " Re-run with webSearch = \"force\" to consult the web, or record the answer in the knowledge graph."
            .to_string()
    } else {
        " Add project documentation or record the answer in the knowledge graph.".to_string()
    }
}
