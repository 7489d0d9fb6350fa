//! Directive validation and dependency planning.
//!
//! Runs before any operation is dispatched. A directive that fails here has
//! no side effects: nothing is cached, nothing is probed.

use crate::SUPPORTED_MAJOR_VERSION;
use crate::args::{collect_references, split_reference};
use crate::directive::{Directive, Operation, OperationKind};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unsupported directive version '{0}' (expected 1.x)")]
    UnsupportedVersion(String),

    #[error("directive tool name is empty")]
    EmptyTool,

    #[error("operation #{index} has an empty store key")]
    EmptyStore { index: usize },

    #[error("operation '{store}' ({op}): args must be a JSON object")]
    ArgsNotObject { store: String, op: OperationKind },

    #[error("operation '{store}' ({op}): missing required argument '{arg}'")]
    MissingArgument {
        store: String,
        op: OperationKind,
        arg: String,
    },

    #[error("operation '{store}' ({op}): invalid argument '{arg}': {reason}")]
    InvalidArgument {
        store: String,
        op: OperationKind,
        arg: String,
        reason: String,
    },

    #[error("operation '{store}': timeoutMs must be greater than zero")]
    ZeroTimeout { store: String },

    #[error("operation '{store}' depends on undeclared key '{missing}'")]
    DanglingDependency { store: String, missing: String },

    #[error("operation '{store}' references '${{{reference}}}' without listing it in dependsOn")]
    UndeclaredReference { store: String, reference: String },

    #[error("dependency cycle among: {}", .keys.join(", "))]
    Cycle { keys: Vec<String> },

    #[error("directive declares {count} composeResult operations; at most one is allowed")]
    MultipleCompose { count: usize },

    #[error("operation '{store}' depends on the composeResult output, which must be terminal")]
    ComposeNotTerminal { store: String },
}

/// Scheduling facts for one operation, indexed by declared position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    pub index: usize,
    /// Operations that must finish first (sorted, deduplicated).
    pub prerequisites: Vec<usize>,
    /// Operations waiting on this one (sorted, deduplicated).
    pub dependents: Vec<usize>,
}

/// A validated directive's dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub nodes: Vec<PlanNode>,
    /// Index of the terminal `composeResult`, if declared.
    pub compose: Option<usize>,
    /// Keys the composed output gathers, in order.
    pub compose_keys: Vec<String>,
    pub warnings: Vec<String>,
}

impl ExecutionPlan {
    /// Operations with no prerequisites, in declared order.
    pub fn roots(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|n| n.prerequisites.is_empty())
            .map(|n| n.index)
            .collect()
    }
}

/// Validate `directive` and build its execution plan.
pub fn validate(directive: &Directive) -> Result<ExecutionPlan, ValidationError> {
    check_version(&directive.version)?;
    if directive.tool.trim().is_empty() {
        return Err(ValidationError::EmptyTool);
    }

    let ops = &directive.operations;
    let mut writers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut warnings = Vec::new();

    for (index, op) in ops.iter().enumerate() {
        check_operation(index, op)?;
        let entry = writers.entry(op.store.as_str()).or_default();
        if let Some(first) = entry.first() {
            warnings.push(format!(
                "store key '{}' is written by operations #{first} and #{index}; last write wins",
                op.store
            ));
        }
        entry.push(index);
    }

    let compose_indices: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.op == OperationKind::ComposeResult)
        .map(|(i, _)| i)
        .collect();
    if compose_indices.len() > 1 {
        return Err(ValidationError::MultipleCompose {
            count: compose_indices.len(),
        });
    }
    let compose = compose_indices.first().copied();

    let mut prerequisites: Vec<Vec<usize>> = vec![Vec::new(); ops.len()];
    for (index, op) in ops.iter().enumerate() {
        for dep in &op.depends_on {
            let Some(dep_writers) = writers.get(dep.as_str()) else {
                return Err(ValidationError::DanglingDependency {
                    store: op.store.clone(),
                    missing: dep.clone(),
                });
            };
            if let Some(c) = compose
                && c != index
                && ops[c].store == *dep
            {
                return Err(ValidationError::ComposeNotTerminal {
                    store: op.store.clone(),
                });
            }
            let others: Vec<usize> = dep_writers.iter().copied().filter(|w| *w != index).collect();
            if others.is_empty() {
                return Err(ValidationError::Cycle {
                    keys: vec![op.store.clone()],
                });
            }
            prerequisites[index].extend(others);
        }
        for reference in collect_references(&op.args) {
            if split_reference(&reference, &op.depends_on).is_none() {
                return Err(ValidationError::UndeclaredReference {
                    store: op.store.clone(),
                    reference,
                });
            }
        }
    }

    let compose_keys = match compose {
        Some(c) => {
            let keys = compose_key_list(&ops[c])?;
            let keys = if keys.is_empty() {
                declared_keys(ops, Some(c))
            } else {
                keys
            };
            for key in &keys {
                let Some(key_writers) = writers.get(key.as_str()) else {
                    return Err(ValidationError::DanglingDependency {
                        store: ops[c].store.clone(),
                        missing: key.clone(),
                    });
                };
                prerequisites[c].extend(key_writers.iter().copied().filter(|w| *w != c));
            }
            keys
        }
        None => declared_keys(ops, None),
    };

    let mut nodes: Vec<PlanNode> = prerequisites
        .into_iter()
        .enumerate()
        .map(|(index, mut pre)| {
            pre.sort_unstable();
            pre.dedup();
            PlanNode {
                index,
                prerequisites: pre,
                dependents: Vec::new(),
            }
        })
        .collect();
    for index in 0..nodes.len() {
        for pre in nodes[index].prerequisites.clone() {
            nodes[pre].dependents.push(index);
        }
    }
    for node in &mut nodes {
        node.dependents.sort_unstable();
        node.dependents.dedup();
    }

    check_acyclic(ops, &nodes)?;

    Ok(ExecutionPlan {
        nodes,
        compose,
        compose_keys,
        warnings,
    })
}

fn check_version(version: &str) -> Result<(), ValidationError> {
    let major = version.split('.').next().unwrap_or_default();
    if major == SUPPORTED_MAJOR_VERSION {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedVersion(version.to_string()))
    }
}

fn check_operation(index: usize, op: &Operation) -> Result<(), ValidationError> {
    if op.store.trim().is_empty() {
        return Err(ValidationError::EmptyStore { index });
    }
    if op.timeout_ms == Some(0) {
        return Err(ValidationError::ZeroTimeout {
            store: op.store.clone(),
        });
    }
    let Some(args) = op.args.as_object() else {
        return Err(ValidationError::ArgsNotObject {
            store: op.store.clone(),
            op: op.op,
        });
    };
    for arg in op.op.required_args() {
        if args.get(*arg).is_none_or(serde_json::Value::is_null) {
            return Err(ValidationError::MissingArgument {
                store: op.store.clone(),
                op: op.op,
                arg: (*arg).to_string(),
            });
        }
    }
    Ok(())
}

/// `keys` argument of a compose operation; empty means "everything".
fn compose_key_list(op: &Operation) -> Result<Vec<String>, ValidationError> {
    let Some(raw) = op.args.get("keys") else {
        return Ok(Vec::new());
    };
    let invalid = |reason: &str| ValidationError::InvalidArgument {
        store: op.store.clone(),
        op: op.op,
        arg: "keys".to_string(),
        reason: reason.to_string(),
    };
    let items = raw.as_array().ok_or_else(|| invalid("expected an array of store keys"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(ToString::to_string)
                .ok_or_else(|| invalid("every key must be a string"))
        })
        .collect()
}

/// Distinct store keys in first-declared order, skipping `exclude`.
fn declared_keys(ops: &[Operation], exclude: Option<usize>) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for (index, op) in ops.iter().enumerate() {
        if Some(index) == exclude || keys.contains(&op.store) {
            continue;
        }
        keys.push(op.store.clone());
    }
    keys
}

/// Kahn's algorithm; whatever cannot be ordered sits on a cycle.
fn check_acyclic(ops: &[Operation], nodes: &[PlanNode]) -> Result<(), ValidationError> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.prerequisites.len()).collect();
    let mut queue: VecDeque<usize> = nodes
        .iter()
        .filter(|n| n.prerequisites.is_empty())
        .map(|n| n.index)
        .collect();
    let mut ordered = 0usize;

    while let Some(index) = queue.pop_front() {
        ordered += 1;
        for dependent in &nodes[index].dependents {
            in_degree[*dependent] -= 1;
            if in_degree[*dependent] == 0 {
                queue.push_back(*dependent);
            }
        }
    }

    if ordered == nodes.len() {
        return Ok(());
    }
    let mut keys: Vec<String> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree > 0)
        .map(|(i, _)| ops[i].store.clone())
        .collect();
    keys.dedup();
    Err(ValidationError::Cycle { keys })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::DirectiveKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn probe(store: &str) -> Operation {
        Operation::new(
            OperationKind::ProbeCapability,
            store,
            json!({ "name": "kubectl" }),
        )
    }

    fn directive(ops: Vec<Operation>) -> Directive {
        ops.into_iter().fold(
            Directive::new("test_tool", DirectiveKind::Orchestration),
            Directive::with_operation,
        )
    }

    #[test]
    fn empty_directive_is_valid() {
        let plan = validate(&directive(vec![])).expect("valid");

        assert!(plan.nodes.is_empty());
        assert!(plan.compose_keys.is_empty());
    }

    #[test]
    fn builds_prerequisites_from_depends_on() {
        let plan = validate(&directive(vec![
            probe("a"),
            probe("b"),
            probe("c").depends_on(["a", "b"]),
        ]))
        .expect("valid");

        assert_eq!(plan.roots(), vec![0, 1]);
        assert_eq!(plan.nodes[2].prerequisites, vec![0, 1]);
        assert_eq!(plan.nodes[0].dependents, vec![2]);
        assert_eq!(plan.compose_keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let err = validate(&directive(vec![probe("a").depends_on(["ghost"])])).expect_err("dangling");

        assert_eq!(
            err,
            ValidationError::DanglingDependency {
                store: "a".to_string(),
                missing: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let err = validate(&directive(vec![
            probe("a").depends_on(["c"]),
            probe("b").depends_on(["a"]),
            probe("c").depends_on(["b"]),
            probe("free"),
        ]))
        .expect_err("cycle");

        assert_eq!(
            err,
            ValidationError::Cycle {
                keys: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            }
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = validate(&directive(vec![probe("a").depends_on(["a"])])).expect_err("self");

        assert!(matches!(err, ValidationError::Cycle { .. }));
    }

    #[test]
    fn duplicate_store_warns_and_waits_for_every_writer() {
        let plan = validate(&directive(vec![
            probe("x"),
            probe("x"),
            probe("y").depends_on(["x"]),
        ]))
        .expect("valid");

        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("last write wins"));
        assert_eq!(plan.nodes[2].prerequisites, vec![0, 1]);
        assert_eq!(plan.compose_keys, vec!["x", "y"]);
    }

    #[test]
    fn missing_required_argument_is_rejected() {
        let op = Operation::new(OperationKind::ReadFile, "f", json!({ "path": "a.txt" }));

        let err = validate(&directive(vec![op])).expect_err("missing arg");

        assert!(matches!(
            err,
            ValidationError::MissingArgument { ref arg, .. } if arg == "projectPath"
        ));
    }

    #[test]
    fn references_must_be_declared_dependencies() {
        let op = Operation::new(
            OperationKind::ProbeCapability,
            "p",
            json!({ "name": "${tools.first}" }),
        );

        let err = validate(&directive(vec![probe("tools"), op])).expect_err("undeclared");

        assert!(matches!(err, ValidationError::UndeclaredReference { .. }));
    }

    #[test]
    fn compose_waits_for_listed_keys_only() {
        let compose = Operation::new(
            OperationKind::ComposeResult,
            "result",
            json!({ "keys": ["b"] }),
        );

        let plan = validate(&directive(vec![probe("a"), probe("b"), compose])).expect("valid");

        assert_eq!(plan.compose, Some(2));
        assert_eq!(plan.compose_keys, vec!["b"]);
        assert_eq!(plan.nodes[2].prerequisites, vec![1]);
    }

    #[test]
    fn compose_must_be_terminal_and_unique() {
        let compose = Operation::new(OperationKind::ComposeResult, "result", json!({}));

        let err = validate(&directive(vec![
            compose.clone(),
            probe("a").depends_on(["result"]),
        ]))
        .expect_err("not terminal");
        assert!(matches!(err, ValidationError::ComposeNotTerminal { .. }));

        let err = validate(&directive(vec![compose.clone(), compose])).expect_err("two composes");
        assert_eq!(err, ValidationError::MultipleCompose { count: 2 });
    }

    #[test]
    fn version_and_timeout_checks() {
        let mut d = directive(vec![probe("a")]);
        d.version = "2.0".to_string();
        assert!(matches!(
            validate(&d),
            Err(ValidationError::UnsupportedVersion(_))
        ));

        let d = directive(vec![probe("a").with_timeout_ms(0)]);
        assert!(matches!(validate(&d), Err(ValidationError::ZeroTimeout { .. })));
    }
}
