//! Directive protocol.
//!
//! Tool handlers describe their work as a [`Directive`]: a bounded list of
//! typed [`Operation`]s with declared dependencies. This crate owns the wire
//! shapes exchanged with the executor, the error taxonomy attached to
//! results, and the validation pass that turns a directive into an
//! [`ExecutionPlan`] before anything runs.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod args;
pub mod directive;
pub mod result;
pub mod validation;

pub use args::{ReferenceError, collect_references, resolve_args};
pub use directive::{Directive, DirectiveId, DirectiveKind, Operation, OperationKind};
pub use result::{
    ComposedOutput, DirectiveFailure, ErrorKind, ExecutionResult, ExecutionStatus,
    FALLBACK_TAG, FallbackOutput, MissingEntry, OperationError, OperationResult, OperationTrace,
    TraceStatus,
};
pub use validation::{ExecutionPlan, PlanNode, ValidationError, validate};

/// Major directive version understood by this crate.
pub const SUPPORTED_MAJOR_VERSION: &str = "1";
