//! Engine error types
//!
//! Every failure inside the engine carries a category for structured
//! logging and maps onto the wire [`ErrorKind`] attached to operation
//! results. Default policy: operation-level failures are recorded against
//! their `store` key; only non-optional failures abort a directive.

use directive_async_utils::DeadlineElapsed;
use directive_protocol::{ErrorKind, OperationError};
use thiserror::Error;

/// Error category for structured logging and behavior mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// `engine.toml` or env misconfigured
    ConfigError,
    /// Capability probe request named something outside the catalogue
    ProbeError,
    /// Project file scan failed
    ScanError,
    /// Knowledge-graph collaborator failed
    GraphError,
    /// Web search or completion collaborator failed
    UpstreamError,
    /// Task-tracking collaborator rejected a transition
    TaskError,
    /// A deadline elapsed
    TimeoutError,
    /// Caller cancelled the work
    CancelledError,
    /// Unexpected logic bugs
    InternalError,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigError => "CONFIG_ERROR",
            Self::ProbeError => "PROBE_ERROR",
            Self::ScanError => "SCAN_ERROR",
            Self::GraphError => "GRAPH_ERROR",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::TaskError => "TASK_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::CancelledError => "CANCELLED_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether the research cascade records the failure as a finding and
    /// moves on to the next tier
    pub fn cascade_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ProbeError
                | Self::ScanError
                | Self::GraphError
                | Self::UpstreamError
                | Self::TimeoutError
                | Self::InternalError
        )
    }
}

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Engine error with category and context
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("unknown capability '{name}'")]
    UnknownCapability { name: String },

    #[error("scan error: {message}")]
    Scan {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("knowledge graph error: {message}")]
    Graph {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("upstream error: {message}")]
    Upstream {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("task error: {message}")]
    Task { message: String },

    #[error("timed out after {limit_ms}ms: {message}")]
    Timeout { message: String, limit_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },
}

impl EngineError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } => ErrorCategory::ConfigError,
            Self::UnknownCapability { .. } => ErrorCategory::ProbeError,
            Self::Scan { .. } => ErrorCategory::ScanError,
            Self::Graph { .. } => ErrorCategory::GraphError,
            Self::Upstream { .. } => ErrorCategory::UpstreamError,
            Self::Task { .. } => ErrorCategory::TaskError,
            Self::Timeout { .. } => ErrorCategory::TimeoutError,
            Self::Cancelled => ErrorCategory::CancelledError,
            Self::Internal { .. } => ErrorCategory::InternalError,
        }
    }

    /// Wire error kind for this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::ValidationError,
            Self::UnknownCapability { .. } => ErrorKind::InvalidArguments,
            Self::Scan { .. } | Self::Graph { .. } => ErrorKind::SourceUnavailable,
            Self::Upstream { .. } | Self::Task { .. } => ErrorKind::UpstreamFailure,
            Self::Timeout { .. } => ErrorKind::OperationTimeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::SourceUnavailable,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn unknown_capability(name: impl Into<String>) -> Self {
        Self::UnknownCapability { name: name.into() }
    }

    pub fn scan(message: impl Into<String>) -> Self {
        Self::Scan {
            message: message.into(),
            source: None,
        }
    }

    pub fn scan_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Scan {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph {
            message: message.into(),
            source: None,
        }
    }

    pub fn graph_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Graph {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            source: None,
        }
    }

    pub fn task(message: impl Into<String>) -> Self {
        Self::Task {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>, limit_ms: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            limit_ms,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Convert into the error recorded against an operation's `store` key
    pub fn to_operation_error(&self) -> OperationError {
        OperationError::new(self.kind(), self.to_string())
    }
}

impl From<DeadlineElapsed> for EngineError {
    fn from(DeadlineElapsed(limit): DeadlineElapsed) -> Self {
        Self::Timeout {
            message: "call exceeded its deadline".to_string(),
            limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(EngineError::unknown_capability("x").kind(), ErrorKind::InvalidArguments);
        assert_eq!(EngineError::upstream("x").kind(), ErrorKind::UpstreamFailure);
        assert_eq!(EngineError::timeout("x", 5).kind(), ErrorKind::OperationTimeout);
        assert_eq!(EngineError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn elapsed_deadlines_convert() {
        let err: EngineError = DeadlineElapsed(Duration::from_millis(250)).into();

        assert!(matches!(err, EngineError::Timeout { limit_ms: 250, .. }));
        assert!(err.category().cascade_recoverable());
        assert!(!EngineError::Cancelled.category().cascade_recoverable());
        assert!(!EngineError::config("x").category().cascade_recoverable());
    }

    #[test]
    fn operation_error_keeps_message() {
        let op_err = EngineError::scan("project path missing").to_operation_error();

        assert_eq!(op_err.kind, ErrorKind::SourceUnavailable);
        assert!(op_err.message.contains("project path missing"));
    }
}
