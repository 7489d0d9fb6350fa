//! Web search tier (research tier 4). Never runs unless forced.

use super::catalog::QuestionProfile;
use super::{ResearchFinding, ResearchSource};
use crate::collaborators::WebSearchClient;
use crate::errors::Result;

pub const RELEVANT_RESULT: f64 = 0.65;
pub const GENERIC_RESULT: f64 = 0.3;

pub async fn consult(
    client: &dyn WebSearchClient,
    question: &str,
    profile: &QuestionProfile,
    limit: usize,
) -> Result<Vec<ResearchFinding>> {
    let results = client.search(question, limit).await?;
    if results.is_empty() {
        return Ok(vec![ResearchFinding::new(
            ResearchSource::WebSearch,
            "web search returned no results",
            0.0,
        )]);
    }

    Ok(results
        .into_iter()
        .take(limit)
        .map(|result| {
            let text = format!("{} {}", result.title, result.snippet).to_lowercase();
            let confidence = if profile.relevant.iter().any(|t| t.mentioned_in(&text)) {
                RELEVANT_RESULT
            } else {
                GENERIC_RESULT
            };
            let content = if result.snippet.is_empty() {
                result.title
            } else {
                format!("{}: {}", result.title, result.snippet)
            };
            ResearchFinding::new(ResearchSource::WebSearch, content, confidence).with_reference(result.url)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::SearchResult;
    use async_trait::async_trait;

    struct FixedResults(Vec<SearchResult>);

    #[async_trait]
    impl WebSearchClient for FixedResults {
        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchResult>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn relevant_snippets_score_higher() {
        let client = FixedResults(vec![
            SearchResult {
                title: "Deploying to Kubernetes".to_string(),
                url: "https://example.test/k8s".to_string(),
                snippet: "kubectl apply".to_string(),
            },
            SearchResult {
                title: "Release notes".to_string(),
                url: "https://example.test/notes".to_string(),
                snippet: String::new(),
            },
        ]);
        let question = "Does this project deploy to Kubernetes?";
        let profile = QuestionProfile::from_question(question);

        let findings = consult(&client, question, &profile, 5).await.expect("consult");

        assert_eq!(findings[0].confidence, RELEVANT_RESULT);
        assert_eq!(findings[1].confidence, GENERIC_RESULT);
        assert_eq!(findings[1].content, "Release notes");
    }
}
