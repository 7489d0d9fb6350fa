//! Argument references between operations.
//!
//! A string argument of the exact form `"${key}"` or `"${key.field.sub}"` is
//! replaced by the value stored under `key` before dispatch. The key must be
//! listed in the operation's `dependsOn`; validation enforces that.

use serde_json::Value;

/// Why a reference could not be resolved at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("reference '${{{0}}}' does not name a declared dependency")]
    Undeclared(String),

    #[error("dependency '{0}' has no value")]
    MissingValue(String),

    #[error("path '{path}' not found in value of '{key}'")]
    MissingPath { key: String, path: String },
}

/// Extract the inner text of a `${...}` reference, if `raw` is one.
fn reference_body(raw: &str) -> Option<&str> {
    raw.strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|body| !body.is_empty())
}

/// Every reference body appearing anywhere in `args`, in document order.
pub fn collect_references(args: &Value) -> Vec<String> {
    let mut out = Vec::new();
    walk(args, &mut out);
    out
}

fn walk(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(body) = reference_body(s) {
                out.push(body.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
        Value::Object(map) => map.values().for_each(|v| walk(v, out)),
        _ => {}
    }
}

/// Split a reference body into `(dependency key, path segments)`.
///
/// Store keys may themselves contain dots, so the longest dependency key
/// that prefixes the body wins.
pub fn split_reference<'a>(body: &'a str, deps: &[String]) -> Option<(&'a str, Vec<&'a str>)> {
    let key = deps
        .iter()
        .filter(|dep| {
            body == dep.as_str()
                || body
                    .strip_prefix(dep.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
        .max_by_key(|dep| dep.len())?;

    let (head, rest) = body.split_at(key.len());
    let path = rest
        .strip_prefix('.')
        .map(|p| p.split('.').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    Some((head, path))
}

/// Replace every reference in `args` using `lookup` for dependency values.
///
/// `lookup` returns `None` when a dependency produced no usable value (it
/// failed, or holds an error placeholder).
pub fn resolve_args<'m, F>(args: &Value, deps: &[String], lookup: F) -> Result<Value, ReferenceError>
where
    F: Fn(&str) -> Option<&'m Value>,
{
    resolve_value(args, deps, &lookup)
}

fn resolve_value<'m, F>(value: &Value, deps: &[String], lookup: &F) -> Result<Value, ReferenceError>
where
    F: Fn(&str) -> Option<&'m Value>,
{
    match value {
        Value::String(s) => match reference_body(s) {
            Some(body) => {
                let (key, path) = split_reference(body, deps)
                    .ok_or_else(|| ReferenceError::Undeclared(body.to_string()))?;
                let root = lookup(key).ok_or_else(|| ReferenceError::MissingValue(key.to_string()))?;
                navigate(root, &path)
                    .cloned()
                    .ok_or_else(|| ReferenceError::MissingPath {
                        key: key.to_string(),
                        path: path.join("."),
                    })
            }
            None => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, deps, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, deps, lookup)?);
            }
            Ok(Value::Object(out))
        }
        _ => Ok(value.clone()),
    }
}

fn navigate<'v>(root: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;

    fn deps(keys: &[&str]) -> Vec<String> {
        keys.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn collects_nested_references() {
        let args = json!({
            "question": "${q}",
            "nested": { "list": ["plain", "${scan.files.0}"] },
            "literal": "$notref"
        });

        assert_eq!(
            collect_references(&args),
            vec!["q".to_string(), "scan.files.0".to_string()]
        );
    }

    #[test]
    fn longest_dependency_key_wins() {
        let deps = deps(&["a", "a.b"]);

        let (key, path) = split_reference("a.b.c", &deps).expect("split");

        assert_eq!(key, "a.b");
        assert_eq!(path, vec!["c"]);
    }

    #[test]
    fn resolves_paths_into_dependency_values() {
        let memory: HashMap<&str, Value> =
            HashMap::from([("scan", json!({ "files": ["k8s/deploy.yaml"] }))]);
        let args = json!({ "path": "${scan.files.0}", "keep": 3 });

        let resolved =
            resolve_args(&args, &deps(&["scan"]), |k| memory.get(k)).expect("resolve");

        assert_eq!(resolved, json!({ "path": "k8s/deploy.yaml", "keep": 3 }));
    }

    #[test]
    fn missing_dependency_value_is_an_error() {
        let args = json!({ "path": "${scan}" });

        let err = resolve_args(&args, &deps(&["scan"]), |_| None).expect_err("missing");

        assert_eq!(err, ReferenceError::MissingValue("scan".to_string()));
    }

    #[test]
    fn undeclared_reference_is_an_error() {
        let args = json!("${other}");

        let err = resolve_args(&args, &deps(&["scan"]), |_| None).expect_err("undeclared");

        assert_eq!(err, ReferenceError::Undeclared("other".to_string()));
    }
}
