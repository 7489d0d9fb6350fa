//! Directive and operation shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A declarative unit of work returned by a tool handler.
///
/// Immutable once submitted. Submitting the same directive twice is safe:
/// the second run is served from the operation cache where possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub version: String,
    pub tool: String,
    #[serde(default)]
    pub kind: DirectiveKind,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Directive {
    pub fn new(tool: impl Into<String>, kind: DirectiveKind) -> Self {
        Self {
            version: "1.0".to_string(),
            tool: tool.into(),
            kind,
            operations: Vec::new(),
        }
    }

    /// Append an operation (builder style).
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// How the producing tool intends the operations to be read.
///
/// The executor treats all three the same way; the kind is carried through
/// for logging and for tools that render results differently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    #[default]
    Orchestration,
    StateMachine,
    Composition,
}

/// One typed step of a directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub op: OperationKind,
    #[serde(default = "empty_args")]
    pub args: Value,
    /// SessionMemory key receiving this operation's result.
    pub store: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Timeouts of retryable operations are retried with backoff.
    #[serde(default)]
    pub retryable: bool,
}

fn empty_args() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Operation {
    pub fn new(op: OperationKind, store: impl Into<String>, args: Value) -> Self {
        Self {
            op,
            args,
            store: store.into(),
            depends_on: Vec::new(),
            optional: false,
            timeout_ms: None,
            retryable: false,
        }
    }

    pub fn depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Closed set of operation kinds understood by the executor.
///
/// Adding a kind forces every exhaustive match (argument schema, handler
/// table) to be updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    AnswerResearchQuestion,
    ScanProjectFiles,
    QueryKnowledgeGraph,
    ProbeCapability,
    ListCapabilities,
    ReadFile,
    WebSearch,
    ComposeResult,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        Self::AnswerResearchQuestion,
        Self::ScanProjectFiles,
        Self::QueryKnowledgeGraph,
        Self::ProbeCapability,
        Self::ListCapabilities,
        Self::ReadFile,
        Self::WebSearch,
        Self::ComposeResult,
    ];

    /// Wire name, also used as the cache key namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnswerResearchQuestion => "answerResearchQuestion",
            Self::ScanProjectFiles => "scanProjectFiles",
            Self::QueryKnowledgeGraph => "queryKnowledgeGraph",
            Self::ProbeCapability => "probeCapability",
            Self::ListCapabilities => "listCapabilities",
            Self::ReadFile => "readFile",
            Self::WebSearch => "webSearch",
            Self::ComposeResult => "composeResult",
        }
    }

    /// Arguments that must be present before the directive is accepted.
    pub fn required_args(&self) -> &'static [&'static str] {
        match self {
            Self::AnswerResearchQuestion => &["question", "projectPath"],
            Self::ScanProjectFiles => &["projectPath"],
            Self::QueryKnowledgeGraph => &["terms"],
            Self::ProbeCapability => &["name"],
            Self::ListCapabilities => &[],
            Self::ReadFile => &["projectPath", "path"],
            Self::WebSearch => &["query"],
            Self::ComposeResult => &[],
        }
    }

    /// Whether results of this kind go through the operation cache.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, Self::ComposeResult)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one in-flight directive execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectiveId(String);

impl DirectiveId {
    pub fn new() -> Self {
        Self(format!("dir-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DirectiveId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DirectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DirectiveId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DirectiveId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
