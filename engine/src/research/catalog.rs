//! Technology catalogue used to read questions and classify evidence.

use std::collections::BTreeSet;

#[derive(Debug, PartialEq, Eq)]
pub struct Technology {
    pub name: &'static str,
    /// Alternate spellings matched as whole tokens
    pub aliases: &'static [&'static str],
    /// Capability registry entries that indicate this technology on the host
    pub capabilities: &'static [&'static str],
    /// Question words that imply this technology without naming it
    pub topics: &'static [&'static str],
}

impl Technology {
    /// Name plus aliases.
    pub fn spellings(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.name).chain(self.aliases.iter().copied())
    }

    /// Whether lowercased `text` mentions this technology anywhere.
    pub fn mentioned_in(&self, text: &str) -> bool {
        self.spellings().any(|s| s.len() >= 3 && text.contains(s))
    }
}

pub static TECHNOLOGIES: &[Technology] = &[
    Technology {
        name: "kubernetes",
        aliases: &["k8s", "kubectl", "kube"],
        capabilities: &["kubectl"],
        topics: &["orchestration", "orchestrator", "cluster", "pod", "pods"],
    },
    Technology {
        name: "openshift",
        aliases: &["oc", "okd"],
        capabilities: &["oc"],
        topics: &[],
    },
    Technology {
        name: "helm",
        aliases: &["chart", "charts"],
        capabilities: &["helm"],
        topics: &[],
    },
    Technology {
        name: "docker",
        aliases: &["dockerfile", "docker-compose", "compose"],
        capabilities: &["docker"],
        topics: &["container", "containers", "containerized", "image", "runtime"],
    },
    Technology {
        name: "podman",
        aliases: &[],
        capabilities: &["podman"],
        topics: &["container", "containers", "runtime"],
    },
    Technology {
        name: "terraform",
        aliases: &["tf", "hcl"],
        capabilities: &["terraform"],
        topics: &["infrastructure", "iac", "provisioning"],
    },
    Technology {
        name: "pulumi",
        aliases: &[],
        capabilities: &["pulumi"],
        topics: &["infrastructure", "iac"],
    },
    Technology {
        name: "ansible",
        aliases: &["playbook", "playbooks"],
        capabilities: &["ansible"],
        topics: &["provisioning"],
    },
    Technology {
        name: "node",
        aliases: &["nodejs", "node.js", "npm", "javascript", "typescript"],
        capabilities: &["node", "npm"],
        topics: &[],
    },
    Technology {
        name: "python",
        aliases: &["python3", "pip", "pyproject"],
        capabilities: &["python3"],
        topics: &[],
    },
    Technology {
        name: "rust",
        aliases: &["cargo"],
        capabilities: &[],
        topics: &[],
    },
    Technology {
        name: "go",
        aliases: &["golang"],
        capabilities: &[],
        topics: &[],
    },
    Technology {
        name: "git",
        aliases: &[],
        capabilities: &["git"],
        topics: &["vcs"],
    },
    Technology {
        name: "aws",
        aliases: &["amazon", "eks", "ecs"],
        capabilities: &["aws"],
        topics: &["cloud"],
    },
    Technology {
        name: "gcp",
        aliases: &["gcloud", "gke"],
        capabilities: &["gcloud"],
        topics: &["cloud"],
    },
    Technology {
        name: "azure",
        aliases: &["az", "aks"],
        capabilities: &["az"],
        topics: &["cloud"],
    },
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "does", "this", "that", "what", "which", "with", "use", "uses", "used",
    "using", "are", "was", "were", "how", "why", "who", "when", "where", "project", "repo",
    "repository", "our", "its", "any", "there", "have", "has", "from", "into", "about", "should",
    "can", "could", "would", "will", "deploy", "deployed", "deployment", "run", "runs",
];

pub fn find(name: &str) -> Option<&'static Technology> {
    TECHNOLOGIES.iter().find(|t| t.name == name)
}

/// Lowercased word tokens of `text` (letters, digits, `.`, `-`, `_`).
pub fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || matches!(c, '.' | '-' | '_')))
        .map(|t| t.trim_matches(|c: char| matches!(c, '.' | '-' | '_')))
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// What a question is about, derived once per cascade run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuestionProfile {
    /// Distinct content words in first-seen order
    pub keywords: Vec<String>,
    /// Technologies named outright
    pub named: Vec<&'static Technology>,
    /// Named technologies, or topic-implied ones when none are named
    pub relevant: Vec<&'static Technology>,
}

impl QuestionProfile {
    pub fn from_question(text: &str) -> Self {
        let all_tokens = tokens(text);
        let token_set: BTreeSet<&str> = all_tokens.iter().map(String::as_str).collect();

        let named: Vec<&'static Technology> = TECHNOLOGIES
            .iter()
            .filter(|t| t.spellings().any(|s| token_set.contains(s)))
            .collect();
        let relevant = if named.is_empty() {
            TECHNOLOGIES
                .iter()
                .filter(|t| t.topics.iter().any(|topic| token_set.contains(topic)))
                .collect()
        } else {
            named.clone()
        };

        let mut keywords: Vec<String> = Vec::new();
        for token in all_tokens {
            if token.len() < 3 && !named.iter().any(|t| t.spellings().any(|s| s == token)) {
                continue;
            }
            if STOPWORDS.contains(&token.as_str()) || keywords.contains(&token) {
                continue;
            }
            keywords.push(token);
        }

        Self {
            keywords,
            named,
            relevant,
        }
    }

    pub fn is_relevant(&self, technology: &str) -> bool {
        self.relevant.iter().any(|t| t.name == technology)
    }

    /// Capability names worth probing for this question.
    pub fn capabilities(&self) -> Vec<&'static str> {
        let mut caps: Vec<&'static str> = Vec::new();
        for cap in self.relevant.iter().flat_map(|t| t.capabilities.iter().copied()) {
            if !caps.contains(&cap) {
                caps.push(cap);
            }
        }
        caps
    }

    /// Terms handed to the knowledge graph: keywords plus technology names.
    pub fn graph_terms(&self) -> Vec<String> {
        let mut terms = self.keywords.clone();
        for tech in &self.relevant {
            if !terms.iter().any(|t| t == tech.name) {
                terms.push(tech.name.to_string());
            }
        }
        terms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn named_technology_wins_over_topics() {
        let profile = QuestionProfile::from_question("Does this project deploy to Kubernetes?");

        assert_eq!(profile.named.iter().map(|t| t.name).collect::<Vec<_>>(), vec!["kubernetes"]);
        assert_eq!(profile.capabilities(), vec!["kubectl"]);
        assert_eq!(profile.keywords, vec!["kubernetes".to_string()]);
    }

    #[test]
    fn topics_imply_technologies_when_none_named() {
        let profile = QuestionProfile::from_question("Which container runtime is used?");

        assert!(profile.named.is_empty());
        assert!(profile.is_relevant("docker"));
        assert!(profile.is_relevant("podman"));
        assert_eq!(profile.capabilities(), vec!["docker", "podman"]);
    }

    #[test]
    fn short_aliases_count_only_as_whole_tokens() {
        let profile = QuestionProfile::from_question("Is oc configured for the staging cluster?");

        assert!(profile.is_relevant("openshift"));
        assert!(!profile.is_relevant("kubernetes"));
        assert!(profile.keywords.contains(&"oc".to_string()));
    }

    #[test]
    fn unrelated_question_has_no_relevant_technologies() {
        let profile = QuestionProfile::from_question("What is the quarterly budget policy?");

        assert!(profile.relevant.is_empty());
        assert_eq!(
            profile.keywords,
            vec!["quarterly".to_string(), "budget".to_string(), "policy".to_string()]
        );
    }
}
