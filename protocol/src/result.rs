//! Result shapes and the error taxonomy.

use crate::directive::{DirectiveId, OperationKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Tag attached to output produced by the AI-completion fallback.
pub const FALLBACK_TAG: &str = "fallback-generated";

/// Error taxonomy shared by operations and whole directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed directive or cyclic/dangling dependency. Never retried.
    ValidationError,
    /// A single operation exceeded its time bound.
    OperationTimeout,
    /// Directive-level time or memory-entry ceiling reached.
    ResourceExhausted,
    /// A source could not be consulted (tool missing, file absent).
    SourceUnavailable,
    /// Web search or fallback completion failed.
    UpstreamFailure,
    /// Arguments did not decode into the handler's expected shape.
    InvalidArguments,
    /// The directive was cancelled by its caller.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "ValidationError",
            Self::OperationTimeout => "OperationTimeout",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::SourceUnavailable => "SourceUnavailable",
            Self::UpstreamFailure => "UpstreamFailure",
            Self::InvalidArguments => "InvalidArguments",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Hint shown alongside every user-visible failure of this kind.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::ValidationError => {
                "fix the directive: every dependsOn key must name a declared store key and the dependency graph must be acyclic"
            }
            Self::OperationTimeout => "raise the operation's timeoutMs or mark it retryable",
            Self::ResourceExhausted => {
                "raise directiveTimeoutMs or maxMemoryEntries, or split the directive"
            }
            Self::SourceUnavailable => {
                "install or configure the missing source, or mark the operation optional"
            }
            Self::UpstreamFailure => "check the upstream service or configure a fallback",
            Self::InvalidArguments => "check the operation arguments against the expected schema",
            Self::Cancelled => "re-submit the directive if the work is still needed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error attached to an operation's `store` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(limit_ms: u64) -> Self {
        Self::new(
            ErrorKind::OperationTimeout,
            format!("operation exceeded {limit_ms}ms"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SourceUnavailable, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamFailure, message)
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }
}

/// Result of one operation as held in SessionMemory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub value: Value,
    pub duration_ms: u64,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl OperationResult {
    pub fn success(value: Value, duration_ms: u64, cache_hit: bool) -> Self {
        Self {
            value,
            duration_ms,
            cache_hit,
            error: None,
        }
    }

    /// Null placeholder stored for a failed optional operation.
    pub fn placeholder(error: OperationError, duration_ms: u64) -> Self {
        Self {
            value: Value::Null,
            duration_ms,
            cache_hit: false,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Value when the operation succeeded.
    pub fn ok_value(&self) -> Option<&Value> {
        self.error.is_none().then_some(&self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Cancelled,
    /// Validation failed; nothing ran.
    Rejected,
}

/// A key the composed output could not include.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingEntry {
    pub key: String,
    /// `None` when the operation never produced a result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub message: String,
}

/// Final output gathered by `composeResult` (or the implicit default).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedOutput {
    pub values: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<MissingEntry>,
}

impl ComposedOutput {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.missing.is_empty()
    }

    pub fn missing_key(&self, key: &str) -> Option<&MissingEntry> {
        self.missing.iter().find(|m| m.key == key)
    }
}

/// Structured directive-level failure. Never a silently empty success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Directive id under which the partial SessionMemory is returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_results_ref: Option<String>,
    pub remediation: String,
}

impl DirectiveFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>, partial: Option<&DirectiveId>) -> Self {
        Self {
            kind,
            message: message.into(),
            partial_results_ref: partial.map(ToString::to_string),
            remediation: kind.remediation().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackOutput {
    pub text: String,
    pub tag: String,
}

impl FallbackOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tag: FALLBACK_TAG.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    NotStarted,
    Succeeded,
    CacheHit,
    Failed,
    /// Finished after the directive stopped; excluded from the output.
    Discarded,
}

/// Per-operation record, kept in declared order regardless of completion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTrace {
    pub index: usize,
    pub store: String,
    pub op: OperationKind,
    pub status: TraceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub directive_id: DirectiveId,
    pub tool: String,
    pub status: ExecutionStatus,
    pub output: ComposedOutput,
    /// SessionMemory at the end of execution (partial on failure).
    pub memory: BTreeMap<String, OperationResult>,
    pub trace: Vec<OperationTrace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<DirectiveFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn placeholder_serializes_error_kind() {
        let result = OperationResult::placeholder(OperationError::timeout(50), 51);

        let encoded = serde_json::to_value(&result).expect("encode");

        assert_eq!(
            encoded,
            json!({
                "value": null,
                "durationMs": 51,
                "cacheHit": false,
                "error": { "kind": "OperationTimeout", "message": "operation exceeded 50ms" }
            })
        );
        assert!(result.ok_value().is_none());
    }

    #[test]
    fn failure_carries_remediation_and_partial_ref() {
        let id = DirectiveId::from("dir-1");

        let failure = DirectiveFailure::new(ErrorKind::ResourceExhausted, "deadline", Some(&id));

        assert_eq!(failure.partial_results_ref.as_deref(), Some("dir-1"));
        assert_eq!(failure.remediation, ErrorKind::ResourceExhausted.remediation());
    }

    #[test]
    fn fallback_output_is_tagged() {
        assert_eq!(FallbackOutput::new("summary").tag, "fallback-generated");
    }
}
