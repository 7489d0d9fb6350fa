//! Output composition and the fallback prompt.

use directive_protocol::{ComposedOutput, MissingEntry, OperationResult};
use std::collections::BTreeMap;

/// Gather `keys` from SessionMemory. Never fails: error placeholders and
/// keys that were never produced are listed under `missing`.
pub fn compose(keys: &[String], memory: &BTreeMap<String, OperationResult>) -> ComposedOutput {
    let mut output = ComposedOutput::default();
    for key in keys {
        match memory.get(key) {
            Some(result) => match &result.error {
                None => {
                    output.values.insert(key.clone(), result.value.clone());
                }
                Some(err) => output.missing.push(MissingEntry {
                    key: key.clone(),
                    kind: Some(err.kind),
                    message: err.message.clone(),
                }),
            },
            None => output.missing.push(MissingEntry {
                key: key.clone(),
                kind: None,
                message: "operation produced no result".to_string(),
            }),
        }
    }
    output
}

/// Prompt handed to the completion collaborator when a directive fails.
pub fn fallback_prompt(
    tool: &str,
    failure: &str,
    memory: &BTreeMap<String, OperationResult>,
    never_ran: &[String],
) -> String {
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for (key, result) in memory {
        match &result.error {
            None => succeeded.push(key.clone()),
            Some(err) => failed.push(format!("{key} ({})", err.kind)),
        }
    }

    let list = |items: &[String]| {
        if items.is_empty() {
            "none".to_string()
        } else {
            items.join(", ")
        }
    };

    format!(
        "The '{tool}' directive failed: {failure}.\n\
         Succeeded: {}.\n\
         Failed: {}.\n\
         Not run: {}.\n\
         Using only the succeeded results below, give the best answer you can and say what is missing.\n\
         {}",
        list(&succeeded),
        list(&failed),
        list(never_ran),
        succeeded_values(memory),
    )
}

fn succeeded_values(memory: &BTreeMap<String, OperationResult>) -> String {
    memory
        .iter()
        .filter_map(|(key, result)| result.ok_value().map(|v| format!("{key}: {v}")))
        .collect::<Vec<_>>()
        .join("\n")
}
